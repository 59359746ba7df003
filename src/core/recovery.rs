//! 错误恢复引擎
//!
//! fallback_result：不可恢复的 Cycle 失败的唯一出口，构造失败结果而不是向调用方抛错。
//! retry_with_backoff：对外部调用（生成后端、语义索引）做指数退避重试，
//! 延迟 = base_delay × 2^(attempt-1) + jitter，预算耗尽后返回最后一次的原始错误。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::RecoverySection;
use crate::core::AgentError;

/// 退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次）
    pub max_retries: u32,
    pub base_delay: Duration,
    /// 抖动上限，实际抖动在 [0, max_jitter) 内均匀取值
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RecoverySection) -> Self {
        Self {
            max_retries: cfg.max_retries.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_jitter: Duration::from_millis(cfg.max_jitter_ms),
        }
    }

    /// 不等待、只尝试一次（测试或禁用重试时使用）
    pub fn none() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始），不含抖动
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            let ms = rand::thread_rng().gen_range(0..self.max_jitter.as_millis().max(1) as u64);
            Duration::from_millis(ms)
        };
        self.base_delay_for(attempt) + jitter
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
        }
    }
}

/// 对任意外部调用做退避重试（所有错误都重试）
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(policy, label, op, |_| true).await
}

/// 仅当 should_retry 返回 true 时重试；否则立即返回该错误
pub async fn retry_with_backoff_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_retries || !should_retry(&e) {
                    if attempt >= policy.max_retries {
                        tracing::error!(label, attempt, error = %e, "Max retries reached");
                    }
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    label,
                    attempt,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// 不可恢复失败的结构化结果
#[derive(Debug, Clone, Serialize)]
pub struct FallbackResult {
    pub success: bool,
    pub output: String,
    pub error_type: String,
}

/// 失败兜底：把 AgentError 转为用户可见的降级消息
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn fallback_result(&self, err: &AgentError) -> FallbackResult {
        FallbackResult {
            success: false,
            output: format!("Error: {err}. System is in recovery mode."),
            error_type: format!("recovered_{}_failure", err.kind().as_str()),
        }
    }
}
