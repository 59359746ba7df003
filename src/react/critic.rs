//! Critic：基于规则的回复自检
//!
//! 一组相互独立的结构检查，每条命中累加严重度并记录一条可读的缺陷描述：
//! 未闭合的动作标签、生成后端泄漏的控制 token、过短的非动作回复、对本地访问的错误拒绝。
//! is_valid 与 needs_refinement 使用两个独立阈值。

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::config::CriticSection;

const UNBALANCED_TAG_PENALTY: f64 = 0.8;
const LEAKED_TOKEN_PENALTY: f64 = 0.5;
const TOO_SHORT_PENALTY: f64 = 0.3;
const FALSE_REFUSAL_PENALTY: f64 = 0.6;

const MIN_RESPONSE_CHARS: usize = 10;
const BASE_CONFIDENCE: f64 = 0.9;
const CONFIDENCE_PER_FLAW: f64 = 0.1;

/// 生成后端的对话模板 / 控制 token，不应出现在回复中
pub const LEAKED_TOKENS: &[&str] = &[
    "<｜User｜>",
    "<｜Assistant｜>",
    "Assistant:",
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
];

fn false_refusal_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bI\s+(?:don'?t|do\s+not)\s+have\s+access\b").ok())
        .as_ref()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriticFeedback {
    pub is_valid: bool,
    pub flaws: Vec<String>,
    pub severity_score: f64,
    pub confidence_score: f64,
}

impl CriticFeedback {
    /// 作为修正轮输入的缺陷摘要
    pub fn to_refinement_prompt(&self) -> String {
        let mut out = String::from("Your previous response had these problems:\n");
        for flaw in &self.flaws {
            out.push_str("- ");
            out.push_str(flaw);
            out.push('\n');
        }
        out.push_str("Rewrite the response and fix them.");
        out
    }
}

#[derive(Debug, Clone)]
pub struct SelfCritic {
    validity_threshold: f64,
    refinement_threshold: f64,
}

impl Default for SelfCritic {
    fn default() -> Self {
        Self::new(0.5, 0.5)
    }
}

impl SelfCritic {
    pub fn new(validity_threshold: f64, refinement_threshold: f64) -> Self {
        Self {
            validity_threshold,
            refinement_threshold,
        }
    }

    pub fn from_config(cfg: &CriticSection) -> Self {
        Self::new(cfg.validity_threshold, cfg.refinement_threshold)
    }

    /// input 目前不参与检查，保留给调用方统一签名
    pub fn evaluate(&self, _input: &str, response: &str) -> CriticFeedback {
        let mut flaws = Vec::new();
        let mut severity = 0.0_f64;

        if response.matches("<shell>").count() > response.matches("</shell>").count() {
            flaws.push("Missing closing </shell> tag.".to_string());
            severity += UNBALANCED_TAG_PENALTY;
        }
        if response.matches("<file").count() > response.matches("</file>").count() {
            flaws.push("Missing closing </file> tag.".to_string());
            severity += UNBALANCED_TAG_PENALTY;
        }

        for token in LEAKED_TOKENS {
            let hits = response.matches(token).count();
            if hits > 0 {
                flaws.push(format!("Internal token '{token}' leaked into response ({hits}x)."));
                severity += LEAKED_TOKEN_PENALTY * hits as f64;
            }
        }

        if response.chars().count() < MIN_RESPONSE_CHARS && !response.contains("<shell>") {
            flaws.push("Response is too brief or empty.".to_string());
            severity += TOO_SHORT_PENALTY;
        }

        let refusal = false_refusal_re().is_some_and(|re| re.is_match(response));
        if refusal && response.to_lowercase().contains("file") {
            flaws.push(
                "False refusal: claims no access although commands run locally.".to_string(),
            );
            severity += FALSE_REFUSAL_PENALTY;
        }

        let confidence_score = (BASE_CONFIDENCE - CONFIDENCE_PER_FLAW * flaws.len() as f64).max(0.0);
        CriticFeedback {
            is_valid: severity < self.validity_threshold,
            flaws,
            severity_score: severity,
            confidence_score,
        }
    }

    pub fn needs_refinement(&self, feedback: &CriticFeedback) -> bool {
        feedback.severity_score > self.refinement_threshold
    }
}
