//! Shell 执行器：在项目根目录下执行已确认的命令
//!
//! 执行通过 sh -c / cmd /C，带超时；禁止 rm -rf、mkfs、fork bomb 等危险子串（在启动进程前拒绝）。
//! 非零退出码不是错误，而是 success=false 的结构化结果。

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

use crate::core::AgentError;

/// 禁止的命令/子串（即使用户确认也不执行）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "rm -rf ~",
    "rm -rf *",
    "curl | sh",
    "wget -o- | sh",
    "chmod -r 777 /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// 被信号终止时为 None
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait ShellRunner: Send + Sync {
    /// 执行一条命令；超时返回 AgentError::ShellTimeout
    async fn run(&self, command: &str, timeout: Duration) -> Result<ShellOutput, AgentError>;
}

pub fn check_forbidden(command: &str) -> Result<(), AgentError> {
    let lower = command.to_lowercase();
    for forbidden in FORBIDDEN_SUBSTR {
        if lower.contains(forbidden) {
            return Err(AgentError::ShellFailed(format!(
                "Forbidden pattern: {}",
                forbidden
            )));
        }
    }
    if lower.trim().is_empty() {
        return Err(AgentError::ShellFailed("Empty command".to_string()));
    }
    Ok(())
}

/// 本机 shell
#[derive(Debug, Clone)]
pub struct LocalShell {
    workdir: PathBuf,
}

impl LocalShell {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl ShellRunner for LocalShell {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ShellOutput, AgentError> {
        check_forbidden(command)?;

        tracing::info!(command = %command, "shell execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&self.workdir).kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| AgentError::ShellTimeout(timeout.as_secs()))?
            .map_err(|e| AgentError::ShellFailed(format!("Execution failed: {}", e)))?;

        Ok(ShellOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }
}
