//! Cycle 过程事件：供 CLI 等前端流式展示状态变化、生成文本、动作与自检结果

use serde::Serialize;

use crate::core::confidence::FinalResult;
use crate::core::state::CycleState;
use crate::react::actions::ActionPayload;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CycleEvent {
    /// 状态迁移（在该阶段执行前发出）
    StateChanged { from: CycleState, to: CycleState },
    /// 生成文本的一小段
    Chunk { text: String },
    /// 生成被用户中断，已收到的部分作为完整回复
    GenerationCancelled { partial_chars: usize },
    /// 从回复中提取到的动作（确认前）
    ActionProposed { index: usize, action: ActionPayload },
    /// 动作执行结果；declined 为 true 表示用户拒绝，未执行
    ActionResult {
        index: usize,
        declined: bool,
        success: bool,
        preview: String,
    },
    /// Critic 结论
    Critique {
        severity: f64,
        flaws: Vec<String>,
        needs_refinement: bool,
    },
    /// 本次 Cycle 结束
    Done { result: FinalResult },
}
