//! Planner：任务复杂度分类与建议步骤
//!
//! 对小写后的 intent 做有序关键词匹配：先查复杂信号，再查中等信号，否则为 Simple。
//! 步骤列表按档位固定，仅作为提示写入生成 prompt，不会被机械执行或校验。

use serde::Serialize;

/// 复杂任务信号（优先匹配）
pub const COMPLEX_KEYWORDS: &[&str] = &["refactor", "architect", "add feature", "design"];
/// 中等任务信号
pub const MODERATE_KEYWORDS: &[&str] = &["fix", "change", "update", "implement"];

/// 所有档位共有的前两步
const BASE_STEPS: &[&str] = &[
    "Intent Analysis: Understanding user requirements",
    "Project Alignment: Checking README and structural context",
];

const SIMPLE_STEPS: &[&str] = &[
    "Execution: Performing the direct action",
    "Verification: Confirming result",
];

const MODERATE_STEPS: &[&str] = &[
    "Exploration: MUST run 'ls -R' or find to list relevant files",
    "Modification: Applying targeted changes",
    "Validation: Running local checks",
    "Self-Critique: Ensuring no regressions",
];

const COMPLEX_STEPS: &[&str] = &[
    "Discovery Phase: MUST run recursive directory listing to understand structure",
    "Deep Context Retrieval: MUST read core files via <shell> or <file>",
    "Architectural Audit: Verifying integration logic across modules",
    "Self-Critique: Checking for potential race conditions or resource leaks",
    "Final Polish: Optimizing and cleaning up",
];

/// 关键词匹配：单词按 token 前缀匹配（"fixing" 命中 "fix"），多词短语按子串匹配。
/// 调用方负责先把 text 转成小写。
pub fn matches_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| {
        if kw.contains(' ') {
            text.contains(kw)
        } else {
            text.split(|c: char| !c.is_alphanumeric() && c != '_')
                .any(|token| token.starts_with(kw))
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Simple,
    Moderate,
    Complex,
}

impl TaskComplexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskComplexity::Simple => "simple",
            TaskComplexity::Moderate => "moderate",
            TaskComplexity::Complex => "complex",
        }
    }
}

/// 建议性计划；创建后不可变
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPlan {
    pub complexity: TaskComplexity,
    pub steps: Vec<String>,
}

impl TaskPlan {
    pub fn to_prompt_section(&self) -> String {
        let mut out = format!("## Plan ({})\n", self.complexity.as_str());
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step));
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskPlanner;

impl TaskPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(intent: &str) -> TaskComplexity {
        let intent = intent.to_lowercase();
        if matches_any(&intent, COMPLEX_KEYWORDS) {
            TaskComplexity::Complex
        } else if matches_any(&intent, MODERATE_KEYWORDS) {
            TaskComplexity::Moderate
        } else {
            TaskComplexity::Simple
        }
    }

    /// context 目前不参与分类，保留给调用方统一签名
    pub fn create_plan(&self, intent: &str, _context: &str) -> TaskPlan {
        let complexity = Self::classify(intent);
        let tier: &[&str] = match complexity {
            TaskComplexity::Simple => SIMPLE_STEPS,
            TaskComplexity::Moderate => MODERATE_STEPS,
            TaskComplexity::Complex => COMPLEX_STEPS,
        };
        TaskPlan {
            complexity,
            steps: BASE_STEPS
                .iter()
                .chain(tier)
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complex_checked_before_moderate() {
        assert_eq!(
            TaskPlanner::classify("Refactor the parser and fix the bug"),
            TaskComplexity::Complex
        );
        assert_eq!(
            TaskPlanner::classify("please ADD FEATURE flags"),
            TaskComplexity::Complex
        );
    }

    #[test]
    fn test_moderate_and_simple() {
        assert_eq!(
            TaskPlanner::classify("fixing the login handler"),
            TaskComplexity::Moderate
        );
        assert_eq!(
            TaskPlanner::classify("what is in this repo?"),
            TaskComplexity::Simple
        );
    }

    #[test]
    fn test_token_prefix_not_substring() {
        // "prefix" 含 "fix" 子串，但不是 token 前缀
        assert_eq!(
            TaskPlanner::classify("explain the prefix table"),
            TaskComplexity::Simple
        );
    }

    #[test]
    fn test_steps_fixed_per_tier() {
        let planner = TaskPlanner::new();
        let a = planner.create_plan("update docs", "");
        let b = planner.create_plan("implement cache", "ctx");
        assert_eq!(a.steps, b.steps);
        assert_eq!(a.complexity, TaskComplexity::Moderate);
        let section = a.to_prompt_section();
        assert!(section.starts_with("## Plan (moderate)"));
        assert!(section.contains("1. Intent Analysis: Understanding user requirements"));
        assert!(section.contains("3. Exploration: MUST run 'ls -R'"));
        assert_eq!(a.steps.len(), 6);
    }

    #[test]
    fn test_tiers_share_base_steps() {
        let planner = TaskPlanner::new();
        let simple = planner.create_plan("show the readme", "");
        let complex = planner.create_plan("redesign and refactor storage", "");
        assert_eq!(simple.steps[..2], complex.steps[..2]);
        assert_eq!(simple.steps.len(), 4);
        assert_eq!(complex.steps.len(), 7);
        assert!(complex.steps[2].starts_with("Discovery Phase: MUST run recursive"));
    }
}
