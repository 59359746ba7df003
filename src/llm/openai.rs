//! OpenAI 兼容生成后端
//!
//! 通过 reqwest 调用任意 OpenAI 兼容端点（llama.cpp server / vLLM / Ollama / 云端代理）的
//! `chat/completions`，以 SSE 流式读取 `choices[0].delta.content`；stop sequences 直接透传给后端。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;

use crate::config::LlmSection;
use crate::llm::{ChunkStream, GenerationRequest, Generator, LlmError};

const STATE_IDLE: u8 = 0;
const STATE_ACQUIRED: u8 = 1;
const STATE_RELEASED: u8 = 2;

/// OpenAI 后端最多接受 4 个 stop
const MAX_REMOTE_STOPS: usize = 4;

pub struct OpenAiCompatGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    state: AtomicU8,
}

impl OpenAiCompatGenerator {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            state: AtomicU8::new(STATE_IDLE),
        })
    }

    pub fn from_config(cfg: &LlmSection) -> Result<Option<Self>, LlmError> {
        let Some(base_url) = cfg.base_url.as_deref() else {
            return Ok(None);
        };
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        Self::new(base_url, api_key, Duration::from_secs(cfg.request_timeout_secs)).map(Some)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn request_body(request: &GenerationRequest) -> Value {
        let stops: Vec<&String> = request.stop_sequences.iter().take(MAX_REMOTE_STOPS).collect();
        serde_json::json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stop": stops,
            "stream": true,
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Network(e.to_string())
    }
}

/// 解析一行 SSE：返回 Some(Ok(text)) 为内容，Some(Err) 为错误，None 为忽略；`[DONE]` 由调用方处理
fn parse_sse_line(line: &str) -> Option<Result<String, LlmError>> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Err(LlmError::Malformed(format!("{e}: {data}")))),
    };
    value["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| Ok(s.to_string()))
}

fn is_done_line(line: &str) -> bool {
    line.trim()
        .strip_prefix("data:")
        .map(|d| d.trim() == "[DONE]")
        .unwrap_or(false)
}

struct SseState<S> {
    bytes: S,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, LlmError>>,
    done: bool,
}

#[async_trait]
impl Generator for OpenAiCompatGenerator {
    async fn acquire(&self) -> Result<(), LlmError> {
        if self.state.load(Ordering::SeqCst) == STATE_RELEASED {
            return Err(LlmError::Released);
        }
        let response = self
            .authorized(self.client.get(self.endpoint("models")))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: "model listing failed".to_string(),
            });
        }
        self.state.store(STATE_ACQUIRED, Ordering::SeqCst);
        tracing::info!(base_url = %self.base_url, "generator acquired");
        Ok(())
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<ChunkStream, LlmError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_ACQUIRED => {}
            STATE_RELEASED => return Err(LlmError::Released),
            _ => return Err(LlmError::NotAcquired),
        }
        let response = self
            .authorized(self.client.post(self.endpoint("chat/completions")))
            .json(&Self::request_body(request))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let initial = SseState {
            bytes: Box::pin(response.bytes_stream()),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        };
        let chunks = stream::unfold(initial, |mut st| async move {
            loop {
                if let Some(item) = st.pending.pop_front() {
                    return Some((item, st));
                }
                if st.done {
                    return None;
                }
                match st.bytes.next().await {
                    Some(Ok(bytes)) => {
                        st.buffer.extend_from_slice(&bytes);
                        while let Some(pos) = st.buffer.iter().position(|b| *b == b'\n') {
                            let raw: Vec<u8> = st.buffer.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&raw);
                            if is_done_line(&line) {
                                st.done = true;
                                break;
                            }
                            if let Some(item) = parse_sse_line(&line) {
                                st.pending.push_back(item);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        st.pending.push_back(Err(map_reqwest_error(e)));
                    }
                    None => {
                        st.done = true;
                        let rest = std::mem::take(&mut st.buffer);
                        if let Some(item) = parse_sse_line(&String::from_utf8_lossy(&rest)) {
                            st.pending.push_back(item);
                        }
                    }
                }
            }
        });
        Ok(Box::pin(chunks))
    }

    async fn release(&self) {
        let previous = self.state.swap(STATE_RELEASED, Ordering::SeqCst);
        if previous != STATE_RELEASED {
            tracing::info!(base_url = %self.base_url, "generator released");
        }
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_content_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap().unwrap(), "hel");
    }

    #[test]
    fn test_parse_sse_ignores_role_only_and_done() {
        let role = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(parse_sse_line(role).is_none());
        assert!(parse_sse_line("data: [DONE]").is_none());
        assert!(is_done_line("data: [DONE]\n"));
        assert!(parse_sse_line(": keep-alive").is_none());
    }

    #[test]
    fn test_parse_sse_malformed() {
        assert!(matches!(
            parse_sse_line("data: {not json"),
            Some(Err(LlmError::Malformed(_)))
        ));
    }

    #[test]
    fn test_request_body_caps_stops() {
        let request = GenerationRequest {
            prompt: "p".to_string(),
            model: "m".to_string(),
            max_tokens: 10,
            temperature: 0.1,
            stop_sequences: (0..6).map(|i| format!("s{i}")).collect(),
        };
        let body = OpenAiCompatGenerator::request_body(&request);
        assert_eq!(body["stop"].as_array().unwrap().len(), MAX_REMOTE_STOPS);
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "m");
    }

    #[tokio::test]
    async fn test_stream_requires_acquire() {
        let generator =
            OpenAiCompatGenerator::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let request = GenerationRequest {
            prompt: "p".to_string(),
            model: "m".to_string(),
            max_tokens: 10,
            temperature: 0.1,
            stop_sequences: vec![],
        };
        assert!(matches!(
            generator.stream(&request).await,
            Err(LlmError::NotAcquired)
        ));
        generator.release().await;
        assert!(matches!(
            generator.stream(&request).await,
            Err(LlmError::Released)
        ));
    }
}
