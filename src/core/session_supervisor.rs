//! 会话监管：生成中断
//!
//! 每次生成开始时换一个新的 CancellationToken；用户按键取消只中断当前这一次生成，
//! 已收集的部分文本被当作完整回复继续后续流程。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    current: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(CancellationToken::new()),
        }
    }

    /// 为新一次生成签发 token（替换上一次的）
    pub fn begin_generation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *guard = token.clone();
        token
    }

    /// 取消当前生成（UI 按键触发）
    pub fn cancel_generation(&self) {
        let guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
        guard.cancel();
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
