//! 生成后端抽象
//!
//! 所有后端（OpenAI 兼容 / Scripted）实现 Generator：stream 返回文本块流；
//! acquire / release 是显式的单所有者生命周期，每个进程获取一次、关闭时释放一次，Cycle 中途不会重新获取。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

/// 生成后端错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited")]
    RateLimited,

    #[error("Backend error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Generator handle not acquired")]
    NotAcquired,

    #[error("Generator handle already released")]
    Released,
}

impl LlmError {
    /// 网络抖动、超时、限流、5xx 可退避重试；其余立即失败
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Network(_) | LlmError::Timeout | LlmError::RateLimited => true,
            LlmError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// 一次生成请求
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Router 选出的模型 id
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop_sequences: Vec<String>,
}

/// 文本块流
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

#[async_trait]
pub trait Generator: Send + Sync {
    /// 获取后端句柄（加载模型 / 建立连接）
    async fn acquire(&self) -> Result<(), LlmError>;

    /// 开始一次流式生成；遇到任一 stop sequence 时必须提前结束
    async fn stream(&self, request: &GenerationRequest) -> Result<ChunkStream, LlmError>;

    /// 释放句柄；重复调用无副作用
    async fn release(&self);

    /// 后端名称（日志用）
    fn name(&self) -> &str;
}

/// 若 text 中出现任一 stop sequence，返回最早出现的位置
pub fn find_stop(text: &str, stop_sequences: &[String]) -> Option<usize> {
    stop_sequences
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}
