//! 状态定义：CycleState 状态机与 Cycle（单次用户指令的运行上下文）
//!
//! 合法转移集中声明在 TRANSITIONS 表中；控制器构造时调用 validate_transition_table 校验表的完整性，
//! 运行时每次转移都先查表，非法转移视为 Fatal。

use std::fmt;

use serde::Serialize;

use crate::core::AgentError;
use crate::memory::{Message, Role};

/// Cycle 状态（同一会话任一时刻仅有一个当前状态）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleState {
    Idle,
    Analyzing,
    Planning,
    Routing,
    Executing,
    Verifying,
    Critiquing,
    Refining,
    Completed,
    Failed,
    Recovering,
}

impl CycleState {
    pub const ALL: [CycleState; 11] = [
        CycleState::Idle,
        CycleState::Analyzing,
        CycleState::Planning,
        CycleState::Routing,
        CycleState::Executing,
        CycleState::Verifying,
        CycleState::Critiquing,
        CycleState::Refining,
        CycleState::Completed,
        CycleState::Failed,
        CycleState::Recovering,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "IDLE",
            CycleState::Analyzing => "ANALYZING",
            CycleState::Planning => "PLANNING",
            CycleState::Routing => "ROUTING",
            CycleState::Executing => "EXECUTING",
            CycleState::Verifying => "VERIFYING",
            CycleState::Critiquing => "CRITIQUING",
            CycleState::Refining => "REFINING",
            CycleState::Completed => "COMPLETED",
            CycleState::Failed => "FAILED",
            CycleState::Recovering => "RECOVERING",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleState::Completed | CycleState::Failed)
    }

    /// 查表：当前状态能否转移到 next
    pub fn can_transition_to(&self, next: CycleState) -> bool {
        successors(*self).contains(&next)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 转移表：每个状态的合法后继
///
/// 任意非终止状态都可进入 Recovering / Failed；Critiquing 之后可 Refining（Critic 驱动）、
/// Analyzing（动作结果驱动的下一轮）或 Completed。
pub const TRANSITIONS: &[(CycleState, &[CycleState])] = &[
    (CycleState::Idle, &[CycleState::Analyzing]),
    (
        CycleState::Analyzing,
        &[CycleState::Planning, CycleState::Recovering, CycleState::Failed],
    ),
    (
        CycleState::Planning,
        &[CycleState::Routing, CycleState::Recovering, CycleState::Failed],
    ),
    (
        CycleState::Routing,
        &[CycleState::Executing, CycleState::Recovering, CycleState::Failed],
    ),
    (
        CycleState::Executing,
        &[
            CycleState::Verifying,
            CycleState::Critiquing,
            CycleState::Recovering,
            CycleState::Failed,
        ],
    ),
    (
        CycleState::Verifying,
        &[CycleState::Critiquing, CycleState::Recovering, CycleState::Failed],
    ),
    (
        CycleState::Critiquing,
        &[
            CycleState::Refining,
            CycleState::Analyzing,
            CycleState::Completed,
            CycleState::Recovering,
            CycleState::Failed,
        ],
    ),
    (
        CycleState::Refining,
        &[CycleState::Analyzing, CycleState::Recovering, CycleState::Failed],
    ),
    (CycleState::Recovering, &[CycleState::Failed]),
    (CycleState::Completed, &[CycleState::Idle]),
    (CycleState::Failed, &[CycleState::Idle]),
];

fn successors(state: CycleState) -> &'static [CycleState] {
    TRANSITIONS
        .iter()
        .find(|(from, _)| *from == state)
        .map(|(_, to)| *to)
        .unwrap_or(&[])
}

/// 校验转移表：每个状态恰好一行、不允许自环、终止状态只能回到 Idle、所有状态都可达
pub fn validate_transition_table() -> Result<(), String> {
    for state in CycleState::ALL {
        let rows = TRANSITIONS.iter().filter(|(from, _)| *from == state).count();
        if rows != 1 {
            return Err(format!("state {state} has {rows} rows in transition table"));
        }
        let next = successors(state);
        if next.contains(&state) {
            return Err(format!("state {state} transitions to itself"));
        }
        if state.is_terminal() && next != [CycleState::Idle] {
            return Err(format!("terminal state {state} must only return to IDLE"));
        }
        let active = !state.is_terminal() && state != CycleState::Idle;
        if active && !next.contains(&CycleState::Failed) {
            return Err(format!("state {state} cannot reach FAILED"));
        }
    }
    for state in CycleState::ALL {
        if state == CycleState::Idle {
            continue;
        }
        let reachable = TRANSITIONS.iter().any(|(_, to)| to.contains(&state));
        if !reachable {
            return Err(format!("state {state} is unreachable"));
        }
    }
    Ok(())
}

/// 当前状态持有者：所有转移都经过 transition 查表
#[derive(Debug)]
pub struct StateTracker {
    current: CycleState,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: CycleState::Idle,
        }
    }

    pub fn current(&self) -> CycleState {
        self.current
    }

    /// 查表后切换；返回 (from, to)
    pub fn transition(&mut self, to: CycleState) -> Result<(CycleState, CycleState), AgentError> {
        let from = self.current;
        if !from.can_transition_to(to) {
            return Err(AgentError::InvalidTransition { from, to });
        }
        self.current = to;
        Ok((from, to))
    }

    /// 进入 Failed：按表转移，表中无此边时（如 panic 打断了转移序列）强制进入；已终止时返回 None
    pub fn fail(&mut self) -> Option<(CycleState, CycleState)> {
        if self.current.is_terminal() {
            return None;
        }
        let from = self.current;
        if !from.can_transition_to(CycleState::Failed) {
            tracing::warn!(%from, "forcing FAILED outside transition table");
        }
        self.current = CycleState::Failed;
        Some((from, CycleState::Failed))
    }

    /// 会话层面回到 Idle（仅允许从终止状态）
    pub fn reset(&mut self) {
        if self.current.is_terminal() {
            self.current = CycleState::Idle;
        }
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// 一次用户发起的运行；由控制器独占，Completed / Failed 后丢弃
#[derive(Debug, Clone)]
pub struct Cycle {
    pub id: uuid::Uuid,
    pub initial_input: String,
    /// 每轮会被动作结果或 Critic 反馈替换
    pub current_input: String,
    /// 动作结果驱动的后续轮次数
    pub depth: usize,
    /// Critic 驱动的修正轮次数
    pub refinement_count: usize,
    pub history: Vec<Message>,
}

impl Cycle {
    pub fn new(input: impl Into<String>) -> Self {
        let input = input.into();
        Self {
            id: uuid::Uuid::new_v4(),
            current_input: input.clone(),
            initial_input: input,
            depth: 0,
            refinement_count: 0,
            history: Vec::new(),
        }
    }

    /// 上一轮的回复（首轮之前为 None）
    pub fn last_response(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    /// 本 Cycle 共跑了多少轮（首轮 + 后续 + 修正）
    pub fn rounds(&self) -> usize {
        1 + self.depth + self.refinement_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_valid() {
        assert_eq!(validate_transition_table(), Ok(()));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut tracker = StateTracker::new();
        for next in [
            CycleState::Analyzing,
            CycleState::Planning,
            CycleState::Routing,
            CycleState::Executing,
            CycleState::Verifying,
            CycleState::Critiquing,
            CycleState::Completed,
            CycleState::Idle,
        ] {
            tracker.transition(next).unwrap();
        }
        assert_eq!(tracker.current(), CycleState::Idle);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut tracker = StateTracker::new();
        let err = tracker.transition(CycleState::Completed).unwrap_err();
        assert!(matches!(
            err,
            AgentError::InvalidTransition {
                from: CycleState::Idle,
                to: CycleState::Completed
            }
        ));
        assert_eq!(tracker.current(), CycleState::Idle);
    }

    #[test]
    fn test_fail_from_recovering_and_idle() {
        let mut tracker = StateTracker::new();
        tracker.transition(CycleState::Analyzing).unwrap();
        tracker.transition(CycleState::Recovering).unwrap();
        assert_eq!(
            tracker.fail(),
            Some((CycleState::Recovering, CycleState::Failed))
        );
        assert_eq!(tracker.fail(), None);
        tracker.reset();

        // Idle 没有到 Failed 的边，强制进入
        assert_eq!(tracker.fail(), Some((CycleState::Idle, CycleState::Failed)));
    }

    #[test]
    fn test_any_active_state_can_recover() {
        for state in CycleState::ALL {
            if state.is_terminal() || matches!(state, CycleState::Idle | CycleState::Recovering) {
                continue;
            }
            assert!(state.can_transition_to(CycleState::Recovering), "{state}");
        }
        assert!(CycleState::Recovering.can_transition_to(CycleState::Failed));
    }

    #[test]
    fn test_reset_only_from_terminal() {
        let mut tracker = StateTracker::new();
        tracker.transition(CycleState::Analyzing).unwrap();
        tracker.reset();
        assert_eq!(tracker.current(), CycleState::Analyzing);
    }

    #[test]
    fn test_new_cycle_counters_start_at_zero() {
        let cycle = Cycle::new("list files");
        assert_eq!(cycle.depth, 0);
        assert_eq!(cycle.refinement_count, 0);
        assert_eq!(cycle.current_input, cycle.initial_input);
        assert_eq!(cycle.rounds(), 1);
    }

    #[test]
    fn test_last_response_is_latest_assistant_turn() {
        let mut cycle = Cycle::new("fix the build");
        cycle.history.push(Message::user("fix the build"));
        assert_eq!(cycle.last_response(), None);
        cycle.history.push(Message::assistant("first try"));
        cycle.history.push(Message::user("Critique: too brief"));
        cycle.history.push(Message::assistant("second try"));
        assert_eq!(cycle.last_response(), Some("second try"));
    }
}
