//! Scripted 生成后端（用于测试与离线演示，无需任何 API）
//!
//! 按顺序回放预设回复，最后一条会一直重复；可模拟前 N 次失败、打开流前的延迟、流挂起（用于取消测试）、
//! 不遵守 stop sequence 的后端，并记录每次收到的 GenerationRequest 与 acquire / release 次数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::traits::find_stop;
use crate::llm::{ChunkStream, GenerationRequest, Generator, LlmError};

pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
    chunk_chars: usize,
    failures_left: AtomicUsize,
    failure: LlmError,
    hang_after_output: bool,
    open_delay: Duration,
    honor_stop: bool,
    requests: Mutex<Vec<GenerationRequest>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            chunk_chars: 8,
            failures_left: AtomicUsize::new(0),
            failure: LlmError::Network("scripted failure".to_string()),
            hang_after_output: false,
            open_delay: Duration::ZERO,
            honor_stop: true,
            requests: Mutex::new(Vec::new()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// 离线演示用：一条固定回复
    pub fn echo_offline() -> Self {
        Self::new([
            "No generation backend is configured. Set [llm].base_url in config/default.toml \
             or ARON__LLM__BASE_URL to an OpenAI-compatible endpoint.",
        ])
    }

    pub fn with_chunk_chars(mut self, n: usize) -> Self {
        self.chunk_chars = n.max(1);
        self
    }

    /// 前 n 次 stream 调用返回 err
    pub fn failing_first(mut self, n: usize, err: LlmError) -> Self {
        self.failures_left = AtomicUsize::new(n);
        self.failure = err;
        self
    }

    /// 输出完预设文本后流不结束（模拟长生成，等待取消）
    pub fn hanging(mut self) -> Self {
        self.hang_after_output = true;
        self
    }

    /// 每次打开流前先等待（模拟加载慢的后端）
    pub fn opening_after(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// 原样输出，不在服务端截断 stop sequence
    pub fn ignoring_stop_sequences(mut self) -> Self {
        self.honor_stop = false;
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn stream_calls(&self) -> usize {
        self.requests().len()
    }

    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> String {
        let mut queue = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn acquire(&self) -> Result<(), LlmError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<ChunkStream, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(self.failure.clone());
        }

        let mut text = self.next_response();
        if let Some(pos) = find_stop(&text, &request.stop_sequences).filter(|_| self.honor_stop) {
            text.truncate(pos);
        }
        let chars: Vec<char> = text.chars().collect();
        let chunks: Vec<Result<String, LlmError>> = chars
            .chunks(self.chunk_chars)
            .map(|c| Ok(c.iter().collect()))
            .collect();

        if self.hang_after_output {
            Ok(Box::pin(stream::iter(chunks).chain(stream::pending())))
        } else {
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    async fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
