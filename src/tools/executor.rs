//! 动作执行器
//!
//! 对每个动作先走确认关卡，确认后执行 shell 或文件写入，结果统一转为 ActionOutcome
//! （执行失败、超时、路径逃逸都是 success=false 的结构化结果，不会中断 Cycle）；
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::AgentError;
use crate::react::actions::{ActionOutcome, ActionPayload, ActionRequest};
use crate::tools::{ConfirmationGate, FileWriter, ProjectValidator, ShellOutput, ShellRunner};

/// 超时结果的标记（与普通失败区分）
pub const TIMEOUT_MARKER: &str = "[TIMEOUT]";
const ERROR_MARKER: &str = "[ERROR]";
const PREVIEW_CHARS: usize = 200;

pub struct ActionExecutor {
    shell: Arc<dyn ShellRunner>,
    files: Arc<dyn FileWriter>,
    gate: Arc<dyn ConfirmationGate>,
    shell_timeout: Duration,
    validator: Option<ProjectValidator>,
}

impl ActionExecutor {
    pub fn new(
        shell: Arc<dyn ShellRunner>,
        files: Arc<dyn FileWriter>,
        gate: Arc<dyn ConfirmationGate>,
        shell_timeout_secs: u64,
    ) -> Self {
        Self {
            shell,
            files,
            gate,
            shell_timeout: Duration::from_secs(shell_timeout_secs),
            validator: None,
        }
    }

    /// 文件写入成功后追加项目检查
    pub fn with_validator(mut self, validator: ProjectValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn validator(&self) -> Option<&ProjectValidator> {
        self.validator.as_ref()
    }

    /// 确认并执行；写回 action.confirmed / action.result，返回结果（拒绝时为 None）
    pub async fn process(&self, action: &mut ActionRequest) -> Option<ActionOutcome> {
        action.confirmed = self.gate.ask(&action.payload.describe()).await;
        if !action.confirmed {
            audit(action, "declined", false, 0);
            return None;
        }

        let start = Instant::now();
        let outcome = match &action.payload {
            ActionPayload::Shell { command } => self.run_shell(command).await,
            ActionPayload::FileWrite { path, content } => self.write_file(path, content).await,
        };
        let label = if outcome.report.contains(TIMEOUT_MARKER) {
            "timeout"
        } else if outcome.success {
            "ok"
        } else {
            "error"
        };
        audit(action, label, outcome.success, start.elapsed().as_millis() as u64);
        action.result = Some(outcome.clone());
        Some(outcome)
    }

    async fn run_shell(&self, command: &str) -> ActionOutcome {
        match self.shell.run(command, self.shell_timeout).await {
            Ok(out) => ActionOutcome {
                success: out.success,
                report: shell_report(command, &out),
            },
            Err(AgentError::ShellTimeout(secs)) => ActionOutcome {
                success: false,
                report: format!("[SHELL] $ {command}\n{TIMEOUT_MARKER} command exceeded {secs}s"),
            },
            Err(e) => ActionOutcome {
                success: false,
                report: format!("[SHELL] $ {command}\n{ERROR_MARKER} {e}"),
            },
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> ActionOutcome {
        match self.files.write(path, content).await {
            Ok(status) => ActionOutcome {
                success: true,
                report: format!("[FILE] {}: wrote {} bytes", status.path, status.bytes),
            },
            Err(e) => ActionOutcome {
                success: false,
                report: format!("[FILE] {path}: {ERROR_MARKER} {e}"),
            },
        }
    }
}

fn shell_report(command: &str, out: &ShellOutput) -> String {
    let code = out
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let mut report = format!("[SHELL] $ {command}\n[exit {code}]");
    if !out.stdout.trim().is_empty() {
        report.push('\n');
        report.push_str(out.stdout.trim_end());
    }
    if !out.stderr.trim().is_empty() {
        report.push_str("\nstderr: ");
        report.push_str(out.stderr.trim_end());
    }
    report
}

fn audit(action: &ActionRequest, outcome: &str, ok: bool, duration_ms: u64) {
    let preview = match &action.payload {
        ActionPayload::Shell { command } => command.chars().take(PREVIEW_CHARS).collect::<String>(),
        ActionPayload::FileWrite { path, .. } => path.clone(),
    };
    let audit = serde_json::json!({
        "event": "action_audit",
        "index": action.index,
        "kind": action.kind(),
        "confirmed": action.confirmed,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": duration_ms,
        "preview": preview,
    });
    tracing::info!(audit = %audit.to_string(), "action");
}
