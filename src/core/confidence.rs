//! 置信度引擎
//!
//! calculate_score 为纯函数：从 model_certainty 出发，扣除 Critic 严重度、工具失败与重试次数的惩罚，
//! 最终钳制到 [0, 1]。wrap_response 将答案与元数据包装为对外的 FinalResult。

use serde::Serialize;

use crate::core::CycleState;

const CRITIC_PENALTY_PER_POINT: f64 = 0.5;
const TOOL_FAILURE_PENALTY: f64 = 0.3;
const RETRY_PENALTY: f64 = 0.1;
/// confidence 严格大于该值才视为 production_ready
const PRODUCTION_READY_THRESHOLD: f64 = 0.8;

/// 派生元数据（不持久化）
#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceMetadata {
    pub confidence: f64,
    pub tools_used: Vec<String>,
    pub iterations: usize,
    pub model: String,
    pub learning_mode: bool,
}

/// run_cycle 的返回值：无论成功失败，调用方总能拿到一个结果对象
#[derive(Debug, Clone, Serialize)]
pub struct FinalResult {
    pub answer: String,
    pub confidence: f64,
    pub production_ready: bool,
    pub state: CycleState,
    /// 仅失败时存在（来自 RecoveryEngine::fallback_result）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub metadata: ConfidenceMetadata,
}

impl FinalResult {
    pub fn is_success(&self) -> bool {
        self.state == CycleState::Completed
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConfidenceEngine;

impl ConfidenceEngine {
    pub fn new() -> Self {
        Self
    }

    /// 置信度 ∈ [0, 1]；critic_severity 为负时按 0 处理
    pub fn calculate_score(
        &self,
        critic_severity: f64,
        tool_success: bool,
        retry_count: usize,
        model_certainty: f64,
    ) -> f64 {
        let mut score = model_certainty;
        score -= critic_severity.max(0.0) * CRITIC_PENALTY_PER_POINT;
        if !tool_success {
            score -= TOOL_FAILURE_PENALTY;
        }
        score -= retry_count as f64 * RETRY_PENALTY;
        if score.is_nan() {
            return 0.0;
        }
        score.clamp(0.0, 1.0)
    }

    /// 组装最终结果；learning_mode 时在答案后追加推理说明
    pub fn wrap_response(&self, answer: &str, metadata: ConfidenceMetadata) -> FinalResult {
        let mut answer = answer.to_string();
        if metadata.learning_mode {
            answer.push_str(&rationale_block(&metadata));
        }
        FinalResult {
            answer,
            confidence: metadata.confidence,
            production_ready: metadata.confidence > PRODUCTION_READY_THRESHOLD,
            state: CycleState::Completed,
            error_type: None,
            metadata,
        }
    }
}

fn rationale_block(metadata: &ConfidenceMetadata) -> String {
    let tools = if metadata.tools_used.is_empty() {
        "none".to_string()
    } else {
        metadata.tools_used.join(", ")
    };
    format!(
        "\n\n[ARON REASONING]\n\
         ● Mode: {}\n\
         ● Steps: {} cycles analyzed.\n\
         ● Tools: {}\n\
         ● Logic: Used weighted context retrieval (project + semantic + session) to ensure project awareness.\n\
         ---",
        metadata.model, metadata.iterations, tools
    )
}
