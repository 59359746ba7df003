//! 工具 / 模型路由
//!
//! 纯函数、无 I/O：同样的 (intent, context) 必然得到同样的 RoutingDecision。
//! - 工具：命中读取类关键词选 shell（读取/检查），命中修改类关键词选 file_writer，否则默认 shell
//! - 模型：命中重型关键词或上下文超过阈值选 heavy，否则 fast

use serde::Serialize;

use crate::config::{LlmSection, RouterSection};
use crate::react::planner::matches_any;

/// 读取 / 检查类关键词（优先匹配）
pub const READ_KEYWORDS: &[&str] = &["run", "list", "show", "search"];
/// 写入 / 修改类关键词
pub const WRITE_KEYWORDS: &[&str] = &["write", "create", "modify", "fix"];
/// 需要高能力模型的关键词
pub const HEAVY_KEYWORDS: &[&str] = &["architect", "redesign", "complex", "review"];

const ROUTING_CONFIDENCE: f64 = 0.92;

/// 可选动作工具
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTool {
    /// 读取 / 检查（shell）
    Shell,
    /// 写入 / 修改（文件写入）
    FileWriter,
}

impl ActionTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTool::Shell => "shell",
            ActionTool::FileWriter => "file_writer",
        }
    }
}

/// 推理深度（写入 prompt 的提示）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningDepth {
    Standard,
    Moderate,
    Deep,
}

/// 模型档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProfile {
    Fast,
    Heavy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub primary_tool: ActionTool,
    pub fallback_tool: Option<ActionTool>,
    pub profile: ModelProfile,
    /// 具体模型 id（由档位映射）
    pub selected_model: String,
    pub reasoning_depth: ReasoningDepth,
    pub confidence: f64,
}

impl RoutingDecision {
    pub fn to_prompt_section(&self) -> String {
        let fallback = self
            .fallback_tool
            .map(|t| t.as_str())
            .unwrap_or("none");
        format!(
            "## Routing\nPreferred action: {} (fallback: {})\nReasoning depth: {:?}\n",
            self.primary_tool.as_str(),
            fallback,
            self.reasoning_depth
        )
    }
}

#[derive(Debug, Clone)]
pub struct ToolRouter {
    fast_model: String,
    heavy_model: String,
    heavy_context_chars: usize,
}

impl ToolRouter {
    pub fn new(fast_model: impl Into<String>, heavy_model: impl Into<String>, heavy_context_chars: usize) -> Self {
        Self {
            fast_model: fast_model.into(),
            heavy_model: heavy_model.into(),
            heavy_context_chars,
        }
    }

    pub fn from_config(llm: &LlmSection, router: &RouterSection) -> Self {
        Self::new(
            llm.fast_model.clone(),
            llm.heavy_model.clone(),
            router.heavy_context_chars,
        )
    }

    pub fn model_for(&self, profile: ModelProfile) -> &str {
        match profile {
            ModelProfile::Fast => &self.fast_model,
            ModelProfile::Heavy => &self.heavy_model,
        }
    }

    pub fn select_tool(intent: &str) -> ActionTool {
        let intent = intent.to_lowercase();
        if matches_any(&intent, READ_KEYWORDS) {
            ActionTool::Shell
        } else if matches_any(&intent, WRITE_KEYWORDS) {
            ActionTool::FileWriter
        } else {
            ActionTool::Shell
        }
    }

    pub fn route(&self, intent: &str, context: &str) -> RoutingDecision {
        let primary_tool = Self::select_tool(intent);
        let intent_lower = intent.to_lowercase();

        let (profile, reasoning_depth) = if matches_any(&intent_lower, HEAVY_KEYWORDS) {
            (ModelProfile::Heavy, ReasoningDepth::Deep)
        } else if context.chars().count() > self.heavy_context_chars {
            (ModelProfile::Heavy, ReasoningDepth::Moderate)
        } else {
            (ModelProfile::Fast, ReasoningDepth::Standard)
        };

        RoutingDecision {
            primary_tool,
            fallback_tool: (primary_tool != ActionTool::Shell).then_some(ActionTool::Shell),
            profile,
            selected_model: self.model_for(profile).to_string(),
            reasoning_depth,
            confidence: ROUTING_CONFIDENCE,
        }
    }
}
