//! 写入后的项目检查
//!
//! 根据项目根目录下的清单文件判断项目类型，给出一条快速检查命令。
//! 命令本身仍作为 shell 动作交给 ActionExecutor：同样经过确认关卡与 ShellRunner。

use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectKind {
    Flutter,
    Python,
    Rust,
    Node,
    Generic,
}

impl ProjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectKind::Flutter => "flutter",
            ProjectKind::Python => "python",
            ProjectKind::Rust => "rust",
            ProjectKind::Node => "node",
            ProjectKind::Generic => "generic",
        }
    }

    /// 该类型的检查命令；Generic 没有
    pub fn check_command(&self) -> Option<&'static str> {
        match self {
            ProjectKind::Flutter => Some("flutter analyze"),
            ProjectKind::Python => Some("python -m compileall -q ."),
            ProjectKind::Rust => Some("cargo check --quiet"),
            ProjectKind::Node => Some("npm run --if-present lint"),
            ProjectKind::Generic => None,
        }
    }
}

/// 清单文件 → 项目类型，按顺序匹配第一个存在的
const MANIFESTS: &[(&str, ProjectKind)] = &[
    ("pubspec.yaml", ProjectKind::Flutter),
    ("requirements.txt", ProjectKind::Python),
    ("pyproject.toml", ProjectKind::Python),
    ("Cargo.toml", ProjectKind::Rust),
    ("package.json", ProjectKind::Node),
];

#[derive(Debug, Clone)]
pub struct ProjectValidator {
    root: PathBuf,
}

impl ProjectValidator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 每次调用都重新检测（本轮写入可能刚创建了清单文件）
    pub async fn detect(&self) -> ProjectKind {
        for (manifest, kind) in MANIFESTS {
            if tokio::fs::try_exists(self.root.join(manifest))
                .await
                .unwrap_or(false)
            {
                return *kind;
            }
        }
        ProjectKind::Generic
    }

    /// 检测到的类型与检查命令
    pub async fn check_command(&self) -> Option<(ProjectKind, &'static str)> {
        let kind = self.detect().await;
        match kind.check_command() {
            Some(command) => Some((kind, command)),
            None => {
                tracing::debug!(root = %self.root.display(), "no manifest found, skipping validation");
                None
            }
        }
    }
}
