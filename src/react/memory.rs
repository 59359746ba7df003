//! 三层记忆协调
//!
//! MemoryManager 持有短期会话（FIFO）、项目上下文（启动时加载一次，之后只读）与外部语义索引的引用，
//! get_combined_context 按固定顺序拼接：项目上下文、长期检索片段、最近几轮会话。
//! 语义索引只被查询，不被写入。

use std::path::Path;
use std::sync::Arc;

use crate::config::MemorySection;
use crate::core::recovery::{retry_with_backoff, RetryPolicy};
use crate::memory::{Message, Role, SemanticIndex, ShortTermMemory};

pub const PROJECT_HEADER: &str = "[PROJECT CONTEXT]";
pub const LONG_TERM_HEADER: &str = "[LONG-TERM MEMORY]";
pub const SHORT_TERM_HEADER: &str = "[SHORT-TERM SESSION]";

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

pub struct MemoryManager {
    short_term: ShortTermMemory,
    project_context: String,
    project_loaded: bool,
    index: Arc<dyn SemanticIndex>,
    retry: RetryPolicy,
    cfg: MemorySection,
}

impl MemoryManager {
    pub fn new(cfg: MemorySection, index: Arc<dyn SemanticIndex>, retry: RetryPolicy) -> Self {
        Self {
            short_term: ShortTermMemory::new(cfg.short_term_capacity),
            project_context: String::new(),
            project_loaded: false,
            index,
            retry,
            cfg,
        }
    }

    pub fn add_short_term(&mut self, role: Role, content: impl Into<String>) {
        self.short_term.push(Message {
            role,
            content: content.into(),
        });
    }

    pub fn short_term(&self) -> &ShortTermMemory {
        &self.short_term
    }

    pub fn project_context(&self) -> &str {
        &self.project_context
    }

    pub fn index(&self) -> Arc<dyn SemanticIndex> {
        Arc::clone(&self.index)
    }

    /// 从项目根读取配置的项目文件（每个取前 project_chars 个字符），只在第一次调用时生效；返回读到的文件数
    pub async fn load_project_memory(&mut self, root: &Path) -> usize {
        if self.project_loaded {
            return 0;
        }
        self.project_loaded = true;

        let mut sections = Vec::new();
        for name in &self.cfg.project_files {
            let path = root.join(name);
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    let text = truncate_chars(&text, self.cfg.project_chars);
                    sections.push(format!("File: {name}\n{text}"));
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "project memory file skipped");
                }
            }
        }
        self.project_context = sections.join("\n\n");
        tracing::info!(files = sections.len(), "project memory loaded");
        sections.len()
    }

    async fn long_term_section(&self, query: &str) -> Option<String> {
        if !self.index.enabled() || query.trim().is_empty() {
            return None;
        }
        let index = Arc::clone(&self.index);
        let limit = self.cfg.long_term_top_k;
        let hits = match retry_with_backoff(&self.retry, "semantic_search", || {
            let index = Arc::clone(&index);
            async move { index.search(query, limit).await }
        })
        .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "semantic search unavailable, skipping long-term memory");
                return None;
            }
        };
        if hits.is_empty() {
            return None;
        }
        let snippets: Vec<String> = hits
            .iter()
            .take(limit)
            .map(|h| {
                format!(
                    "File: {}\n{}",
                    h.file_path,
                    truncate_chars(&h.content, self.cfg.snippet_chars)
                )
            })
            .collect();
        Some(snippets.join("\n---\n"))
    }

    /// 拼接三层上下文；空的层整体省略
    pub async fn get_combined_context(&self, query: &str) -> String {
        let mut parts = Vec::new();
        if !self.project_context.is_empty() {
            parts.push(format!("{PROJECT_HEADER}\n{}", self.project_context));
        }
        if let Some(section) = self.long_term_section(query).await {
            parts.push(format!("{LONG_TERM_HEADER}\n{section}"));
        }
        let recent: Vec<String> = self
            .short_term
            .recent(self.cfg.short_term_window)
            .map(Message::render)
            .collect();
        if !recent.is_empty() {
            parts.push(format!("{SHORT_TERM_HEADER}\n{}", recent.join("\n")));
        }
        parts.join("\n\n")
    }

    pub async fn release_index(&self) {
        self.index.release().await;
    }
}
