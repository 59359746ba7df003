//! 短期记忆：会话内最近的对话轮次
//!
//! 严格 FIFO：超出容量时丢弃最旧的一条，只在当前进程内有效。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// "role: content"
    pub fn render(&self) -> String {
        format!("{}: {}", self.role.as_str(), self.content)
    }
}

#[derive(Clone, Debug)]
pub struct ShortTermMemory {
    turns: VecDeque<Message>,
    capacity: usize,
}

impl ShortTermMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, msg: Message) {
        if self.capacity == 0 {
            return;
        }
        while self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(msg);
    }

    /// 最近 n 条（保持时间顺序）
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &Message> {
        self.turns.iter().skip(self.turns.len().saturating_sub(n))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_eviction_keeps_newest() {
        let mut mem = ShortTermMemory::new(10);
        for i in 0..12 {
            mem.push(Message::user(format!("turn {i}")));
        }
        assert_eq!(mem.len(), 10);
        let first = mem.recent(10).next().unwrap();
        assert_eq!(first.content, "turn 2");
        let last: Vec<_> = mem.recent(2).map(|m| m.content.clone()).collect();
        assert_eq!(last, vec!["turn 10", "turn 11"]);
    }

    #[test]
    fn test_recent_window_larger_than_len() {
        let mut mem = ShortTermMemory::new(3);
        mem.push(Message::assistant("only"));
        assert_eq!(mem.recent(5).count(), 1);
        assert_eq!(mem.recent(5).next().unwrap().render(), "assistant: only");
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let mut mem = ShortTermMemory::new(0);
        mem.push(Message::user("dropped"));
        assert!(mem.is_empty());
    }
}
