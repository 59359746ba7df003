//! 人工确认关卡
//!
//! 每个有副作用的动作执行前都要经过 ConfirmationGate；拒绝的动作被跳过，既不算成功也不算失败。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn ask(&self, description: &str) -> bool;
}

/// 终端交互确认（dialoguer），在阻塞线程池中等待输入；读取失败按拒绝处理
#[derive(Debug, Default, Clone)]
pub struct StdinConfirm;

#[async_trait]
impl ConfirmationGate for StdinConfirm {
    async fn ask(&self, description: &str) -> bool {
        let prompt = format!("Allow action? {description}");
        let answer = tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()
        })
        .await;
        match answer {
            Ok(Ok(yes)) => yes,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "confirmation prompt failed, declining");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "confirmation task failed, declining");
                false
            }
        }
    }
}

/// 固定答复（测试与非交互模式）
#[derive(Debug)]
pub struct StaticConfirm {
    answers: Mutex<VecDeque<bool>>,
    default: bool,
    asked: Mutex<Vec<String>>,
}

impl StaticConfirm {
    pub fn always(answer: bool) -> Self {
        Self::sequence([], answer)
    }

    /// 依次给出 answers，用完后返回 default
    pub fn sequence(answers: impl IntoIterator<Item = bool>, default: bool) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            default,
            asked: Mutex::new(Vec::new()),
        }
    }

    /// 收到过的确认描述
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ConfirmationGate for StaticConfirm {
    async fn ask(&self, description: &str) -> bool {
        self.asked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(description.to_string());
        self.answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(self.default)
    }
}
