//! 长期记忆：项目语义索引
//!
//! SemanticIndex 按 query 返回最相关的文件片段；当前实现为 InMemoryIndex（关键词重叠），
//! 后续可接真正的向量库。索引句柄和生成后端一样，在关闭时显式释放。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum IndexError {
    #[error("Index unavailable: {0}")]
    Unavailable(String),

    #[error("Index already released")]
    Released,
}

/// 一条检索结果
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub file_path: String,
    pub content: String,
}

#[async_trait]
pub trait SemanticIndex: Send + Sync {
    /// 按 query 检索最相关的 limit 条
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError>;

    /// 释放索引句柄；重复调用无副作用
    async fn release(&self);

    /// 是否启用（Noop 实现返回 false）
    fn enabled(&self) -> bool {
        true
    }
}

/// 空实现：未配置索引时使用
#[derive(Clone, Default)]
pub struct NoopIndex;

#[async_trait]
impl SemanticIndex for NoopIndex {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        Ok(Vec::new())
    }

    async fn release(&self) {}

    fn enabled(&self) -> bool {
        false
    }
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric() && c != '_')
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

struct IndexedDoc {
    file_path: String,
    content: String,
    tokens: HashSet<String>,
}

/// 内存索引：按关键词重叠打分，同分时保持插入顺序
#[derive(Default)]
pub struct InMemoryIndex {
    docs: RwLock<Vec<IndexedDoc>>,
    released: AtomicBool,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file_path: impl Into<String>, content: impl Into<String>) {
        let content = content.into();
        let tokens = tokenize_lower(&content);
        let mut docs = self.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.push(IndexedDoc {
            file_path: file_path.into(),
            content,
            tokens,
        });
    }

    pub fn with_doc(self, file_path: impl Into<String>, content: impl Into<String>) -> Self {
        self.insert(file_path, content);
        self
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SemanticIndex for InMemoryIndex {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        if self.is_released() {
            return Err(IndexError::Released);
        }
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let docs = self.docs.read().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<(usize, &IndexedDoc)> = docs
            .iter()
            .map(|d| (query_tokens.intersection(&d.tokens).count(), d))
            .filter(|(s, _)| *s > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, d)| SearchHit {
                file_path: d.file_path.clone(),
                content: d.content.clone(),
            })
            .collect())
    }

    async fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            tracing::info!(docs = self.len(), "semantic index released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ranked_by_overlap() {
        let index = InMemoryIndex::new()
            .with_doc("src/db.rs", "fn connect database pool")
            .with_doc("src/main.rs", "fn main parse args and connect")
            .with_doc("README.md", "nothing relevant");
        let hits = index.search("connect database", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].file_path, "src/db.rs");
        assert_eq!(hits[1].file_path, "src/main.rs");
    }

    #[tokio::test]
    async fn test_limit_and_release() {
        let index = InMemoryIndex::new()
            .with_doc("a", "alpha beta")
            .with_doc("b", "alpha gamma");
        assert_eq!(index.search("alpha", 1).await.unwrap().len(), 1);
        index.release().await;
        index.release().await;
        assert!(matches!(
            index.search("alpha", 1).await,
            Err(IndexError::Released)
        ));
    }

    #[tokio::test]
    async fn test_noop_is_empty() {
        let index = NoopIndex;
        assert!(!index.enabled());
        assert!(index.search("anything", 3).await.unwrap().is_empty());
    }
}
