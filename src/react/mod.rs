//! 认知层：Planner、Critic、动作提取、三层记忆协调与 Cycle 回合循环

pub mod actions;
pub mod critic;
pub mod events;
pub mod loop_;
pub mod memory;
pub mod planner;

pub use actions::{ActionKind, ActionOutcome, ActionParser, ActionPayload, ActionRequest, ReplayOrder};
pub use critic::{CriticFeedback, SelfCritic};
pub use events::CycleEvent;
pub use loop_::{CycleOutcome, CycleRunner};
pub use memory::MemoryManager;
pub use planner::{TaskComplexity, TaskPlan, TaskPlanner};
