//! 错误类型与错误分类
//!
//! AgentError 是单次 Cycle 内所有失败的统一载体；kind() 将其映射为三类：
//! Transient（可退避重试）、Execution（动作失败，作为反馈喂给下一轮）、
//! Fatal（在控制器边界转为 fallback 结果）。Critic 发现的问题不经过 AgentError，直接走 Refining。

use thiserror::Error;

use crate::core::CycleState;
use crate::llm::LlmError;

/// 错误分类（决定控制器的处理路径）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Execution,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Execution => "execution",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Cycle 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Generator error: {0}")]
    Generator(#[from] LlmError),

    #[error("Shell command failed: {0}")]
    ShellFailed(String),

    #[error("Shell command timed out after {0}s")]
    ShellTimeout(u64),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("File write failed: {0}")]
    FileWriteFailed(String),

    #[error("Illegal state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: CycleState, to: CycleState },

    #[error("Invalid transition table: {0}")]
    TransitionTable(String),

    #[error("Session already shut down")]
    SessionClosed,

    #[error("Round panicked: {0}")]
    Panicked(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Generator(e) if e.is_transient() => ErrorKind::Transient,
            AgentError::ShellFailed(_)
            | AgentError::ShellTimeout(_)
            | AgentError::PathEscape(_)
            | AgentError::FileWriteFailed(_) => ErrorKind::Execution,
            _ => ErrorKind::Fatal,
        }
    }
}
