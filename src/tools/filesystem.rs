//! 沙箱文件写入
//!
//! SafeFs 绑定项目根目录，写入路径先做词法规范化（处理 `.` 与 `..`），必须落在根目录下，
//! 否则返回 PathEscape。词法检查之后再解析符号链接：最深的已存在祖先目录（创建父目录前）与
//! 父目录（创建后）canonicalize 后都必须仍在根目录内；目标本身是符号链接时拒绝写入。
//! 目标文件可以尚不存在，缺失的父目录会被创建。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::core::AgentError;

/// 写入结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteStatus {
    /// 相对项目根的路径
    pub path: String,
    pub bytes: usize,
    /// 写入前文件已存在
    pub overwritten: bool,
}

#[async_trait]
pub trait FileWriter: Send + Sync {
    async fn write(&self, path: &str, content: &str) -> Result<WriteStatus, AgentError>;
}

/// 沙箱文件系统：绑定根目录，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

/// 纯词法规范化：去掉 `.`，`..` 弹出上一级；越过起点时返回 None
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for comp in path.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => {
                out.push(comp.as_os_str());
                depth = 0;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Some(out)
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析写入目标：相对路径基于根目录，绝对路径必须位于根目录内
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, AgentError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(AgentError::FileWriteFailed("Empty path".to_string()));
        }
        let requested = Path::new(trimmed);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root_dir.join(requested)
        };
        let normalized =
            normalize(&joined).ok_or_else(|| AgentError::PathEscape(trimmed.to_string()))?;
        if normalized == self.root_dir || !normalized.starts_with(&self.root_dir) {
            return Err(AgentError::PathEscape(trimmed.to_string()));
        }
        Ok(normalized)
    }

    /// 解析符号链接后 path 仍须位于根目录内
    async fn ensure_inside_root(&self, path: &Path, requested: &str) -> Result<(), AgentError> {
        let real = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| AgentError::FileWriteFailed(format!("{}: {}", path.display(), e)))?;
        if !real.starts_with(&self.root_dir) {
            tracing::warn!(path = requested, resolved = %real.display(), "write escapes root via symlink");
            return Err(AgentError::PathEscape(requested.to_string()));
        }
        Ok(())
    }

    /// 最深的已存在祖先（目标本身除外）
    async fn deepest_existing_ancestor(target: &Path) -> Option<PathBuf> {
        let mut current = target.parent();
        while let Some(dir) = current {
            if tokio::fs::symlink_metadata(dir).await.is_ok() {
                return Some(dir.to_path_buf());
            }
            current = dir.parent();
        }
        None
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<WriteStatus, AgentError> {
        let target = self.resolve_for_write(path)?;
        let requested = path.trim();

        if let Some(ancestor) = Self::deepest_existing_ancestor(&target).await {
            self.ensure_inside_root(&ancestor, requested).await?;
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::FileWriteFailed(format!("{}: {}", parent.display(), e)))?;
            self.ensure_inside_root(parent, requested).await?;
        }
        let overwritten = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(AgentError::PathEscape(requested.to_string()));
            }
            Ok(_) => true,
            Err(_) => false,
        };
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| AgentError::FileWriteFailed(format!("{}: {}", target.display(), e)))?;

        let relative = target
            .strip_prefix(&self.root_dir)
            .unwrap_or(&target)
            .display()
            .to_string();
        tracing::info!(path = %relative, bytes = content.len(), overwritten, "file written");
        Ok(WriteStatus {
            path: relative,
            bytes: content.len(),
            overwritten,
        })
    }
}

#[async_trait]
impl FileWriter for SafeFs {
    async fn write(&self, path: &str, content: &str) -> Result<WriteStatus, AgentError> {
        self.write_file(path, content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        let status = fs.write("src/nested/mod.rs", "pub fn x() {}").await.unwrap();
        assert_eq!(status.bytes, 13);
        assert!(!status.overwritten);
        let written = std::fs::read_to_string(dir.path().join("src/nested/mod.rs")).unwrap();
        assert_eq!(written, "pub fn x() {}");

        let status = fs.write("./src/nested/../nested/mod.rs", "x").await.unwrap();
        assert!(status.overwritten);
    }

    #[tokio::test]
    async fn test_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        for bad in ["../outside.txt", "a/../../outside.txt", "/etc/passwd", "."] {
            let err = fs.write(bad, "x").await.unwrap_err();
            assert!(matches!(err, AgentError::PathEscape(_)), "{bad}: {err}");
        }
    }

    #[tokio::test]
    async fn test_absolute_path_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        let inside = fs.root().join("notes.md");
        let status = fs
            .write(inside.to_str().unwrap(), "# notes")
            .await
            .unwrap();
        assert_eq!(status.path, "notes.md");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_dir_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let fs = SafeFs::new(dir.path());

        for target in ["link/pwned.txt", "link/deeper/pwned.txt"] {
            let err = fs.write(target, "owned").await.unwrap_err();
            assert!(matches!(err, AgentError::PathEscape(_)), "{target}: {err}");
        }
        assert!(!outside.path().join("pwned.txt").exists());
        assert!(!outside.path().join("deeper").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_target_refused() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.txt");
        std::fs::write(&victim, "original").unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("notes.txt")).unwrap();
        let fs = SafeFs::new(dir.path());

        let err = fs.write("notes.txt", "owned").await.unwrap_err();
        assert!(matches!(err, AgentError::PathEscape(_)));
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "original");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("a/./b/../c")), Some(PathBuf::from("a/c")));
        assert_eq!(normalize(Path::new("../a")), None);
    }
}
