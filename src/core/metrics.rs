//! 指标与转移日志
//!
//! log_transition 只追加、带时间戳；end_request 为每个 Cycle 产出一条 JSON 记录（含完整转移轨迹），
//! 同时通过 tracing 写到 `aron::metrics` target，便于事后调试状态机。

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::CycleState;

/// 单条状态转移记录
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub timestamp: DateTime<Utc>,
    pub from: CycleState,
    pub to: CycleState,
}

/// end_request 的输入
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub cycle_id: String,
    pub intent: String,
    pub tools_selected: Vec<String>,
    pub model_used: String,
    pub confidence: f64,
    pub retry_count: usize,
    pub depth: usize,
    pub final_state: Option<CycleState>,
}

/// 每个 Cycle 一条的结构化日志
#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub cycle_id: String,
    pub intent: String,
    pub duration_ms: u64,
    pub tools_selected: Vec<String>,
    pub model_used: String,
    pub confidence: f64,
    pub retry_count: usize,
    pub depth: usize,
    pub final_state: Option<CycleState>,
    pub state_transitions: Vec<TransitionRecord>,
}

impl RequestLog {
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Default)]
pub struct MetricsTracker {
    started: Option<Instant>,
    transitions: Vec<TransitionRecord>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始一个新请求：清空上一个 Cycle 的轨迹并开始计时
    pub fn start_request(&mut self) {
        self.started = Some(Instant::now());
        self.transitions.clear();
    }

    pub fn log_transition(&mut self, from: CycleState, to: CycleState) {
        tracing::debug!(%from, %to, "state transition");
        self.transitions.push(TransitionRecord {
            timestamp: Utc::now(),
            from,
            to,
        });
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn end_request(&mut self, metadata: RequestMetadata) -> RequestLog {
        let duration_ms = self
            .started
            .take()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let log = RequestLog {
            cycle_id: metadata.cycle_id,
            intent: metadata.intent,
            duration_ms,
            tools_selected: metadata.tools_selected,
            model_used: metadata.model_used,
            confidence: metadata.confidence,
            retry_count: metadata.retry_count,
            depth: metadata.depth,
            final_state: metadata.final_state,
            state_transitions: self.transitions.clone(),
        };
        match serde_json::to_string(&log) {
            Ok(record) => tracing::info!(target: "aron::metrics", record = %record, "cycle finished"),
            Err(e) => tracing::warn!(target: "aron::metrics", error = %e, "failed to serialize cycle record"),
        }
        log
    }
}
