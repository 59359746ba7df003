//! Agent Cycle 控制器
//!
//! 会话级对象：独占状态机、指标、短期记忆与 Cycle 计数，组合 Planner / Router / Critic / 记忆 /
//! 生成后端 / 动作执行器完成一次有界的 Cycle。run_cycle 永远返回 FinalResult：
//! 回合内的任何错误或 panic 都在这里被捕获，经 Recovering → Failed 转为降级结果。
//!
//! 生命周期：start() 获取生成后端并加载项目记忆（run_cycle 在需要时自动调用）；
//! shutdown() 幂等，先输出会话摘要，再释放语义索引，最后释放生成后端。

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::confidence::{ConfidenceEngine, ConfidenceMetadata, FinalResult};
use crate::core::metrics::{MetricsTracker, RequestLog, RequestMetadata};
use crate::core::recovery::{RecoveryEngine, RetryPolicy};
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::shutdown::{GeneratorCleanup, IndexCleanup, ShutdownCoordinator};
use crate::core::state::{Cycle, CycleState, StateTracker};
use crate::core::AgentError;
use crate::llm::{Generator, ToolRouter};
use crate::memory::{ContextCompressor, Role};
use crate::observability::{ResourceMonitor, ResourceUsage};
use crate::react::loop_::{CycleOutcome, CycleRunner, CycleSettings};
use crate::react::{CycleEvent, MemoryManager, SelfCritic, TaskPlanner};
use crate::tools::ActionExecutor;

/// 生成后端自报的确定度（本地后端不提供 logprob，固定为 1.0）
const MODEL_CERTAINTY: f64 = 1.0;

/// 会话摘要（shutdown 时输出）
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SessionSummary {
    pub cycles: usize,
    pub completed: usize,
    pub failed: usize,
    pub average_confidence: f64,
}

impl SessionSummary {
    pub fn render(&self) -> String {
        format!(
            "Session summary: {} cycles ({} completed, {} failed), average confidence {:.2}",
            self.cycles, self.completed, self.failed, self.average_confidence
        )
    }
}

#[derive(Debug, Default)]
struct SessionStats {
    cycles: usize,
    completed: usize,
    failed: usize,
    confidence_sum: f64,
}

impl SessionStats {
    fn record(&mut self, result: &FinalResult) {
        self.cycles += 1;
        if result.is_success() {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.confidence_sum += result.confidence;
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            cycles: self.cycles,
            completed: self.completed,
            failed: self.failed,
            average_confidence: if self.cycles == 0 {
                0.0
            } else {
                self.confidence_sum / self.cycles as f64
            },
        }
    }
}

/// 由 ControllerBuilder 组装的全部协作者
pub(crate) struct ControllerParts {
    pub generator: Arc<dyn Generator>,
    pub memory: MemoryManager,
    pub compressor: ContextCompressor,
    pub router: ToolRouter,
    pub critic: SelfCritic,
    pub executor: ActionExecutor,
    pub monitor: Box<dyn ResourceMonitor>,
    pub retry: RetryPolicy,
    pub settings: CycleSettings,
    pub project_root: PathBuf,
    pub learning_mode: bool,
    pub event_tx: Option<UnboundedSender<CycleEvent>>,
}

pub struct AgentCycleController {
    generator: Arc<dyn Generator>,
    memory: MemoryManager,
    compressor: ContextCompressor,
    planner: TaskPlanner,
    router: ToolRouter,
    critic: SelfCritic,
    confidence: ConfidenceEngine,
    recovery: RecoveryEngine,
    executor: ActionExecutor,
    supervisor: Arc<SessionSupervisor>,
    monitor: Box<dyn ResourceMonitor>,
    retry: RetryPolicy,
    settings: CycleSettings,
    project_root: PathBuf,
    learning_mode: bool,
    event_tx: Option<UnboundedSender<CycleEvent>>,
    state: StateTracker,
    metrics: MetricsTracker,
    stats: SessionStats,
    last_log: Option<RequestLog>,
    started: bool,
    closed: AtomicBool,
}

impl AgentCycleController {
    pub(crate) fn from_parts(parts: ControllerParts) -> Result<Self, AgentError> {
        crate::core::state::validate_transition_table().map_err(AgentError::TransitionTable)?;
        Ok(Self {
            generator: parts.generator,
            memory: parts.memory,
            compressor: parts.compressor,
            planner: TaskPlanner::new(),
            router: parts.router,
            critic: parts.critic,
            confidence: ConfidenceEngine::new(),
            recovery: RecoveryEngine::new(),
            executor: parts.executor,
            supervisor: Arc::new(SessionSupervisor::new()),
            monitor: parts.monitor,
            retry: parts.retry,
            settings: parts.settings,
            project_root: parts.project_root,
            learning_mode: parts.learning_mode,
            event_tx: parts.event_tx,
            state: StateTracker::new(),
            metrics: MetricsTracker::new(),
            stats: SessionStats::default(),
            last_log: None,
            started: false,
            closed: AtomicBool::new(false),
        })
    }

    /// 获取生成后端（整个进程只获取一次），加载项目记忆
    pub async fn start(&mut self) -> Result<(), AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::SessionClosed);
        }
        if self.started {
            return Ok(());
        }
        let generator = Arc::clone(&self.generator);
        crate::core::recovery::retry_with_backoff_if(
            &self.retry,
            "generator_acquire",
            || generator.acquire(),
            crate::llm::LlmError::is_transient,
        )
        .await?;
        let files = self.memory.load_project_memory(&self.project_root).await;
        self.started = true;
        tracing::info!(
            generator = self.generator.name(),
            project_files = files,
            root = %self.project_root.display(),
            "session started"
        );
        Ok(())
    }

    /// 运行一次 Cycle；永远返回结果，不向调用方传播错误
    pub async fn run_cycle(&mut self, input: &str) -> FinalResult {
        let mut cycle = Cycle::new(input);
        self.metrics.start_request();

        // 已关闭时 start 返回 SessionClosed；已启动时为空操作
        let outcome = match self.start().await {
            Ok(()) => self.run_rounds(&mut cycle).await,
            Err(e) => (Err(e), CycleOutcome::default()),
        };

        let (result, reply) = match outcome {
            (Ok(()), progress) => {
                let reply = progress.answer.clone();
                (self.finalize(&cycle, progress), reply)
            }
            (Err(err), progress) => {
                let reply = progress.answer.clone();
                (self.fail(&cycle, err, progress), reply)
            }
        };

        // 短期记忆只存模型的原始回复：不含推理摘要，也不含降级提示
        self.memory.add_short_term(Role::User, cycle.initial_input.clone());
        if !reply.is_empty() {
            self.memory.add_short_term(Role::Assistant, reply);
        }
        self.stats.record(&result);
        self.state.reset();

        if let Some(tx) = &self.event_tx {
            let _ = tx.send(CycleEvent::Done {
                result: result.clone(),
            });
        }
        result
    }

    /// 跑回合循环；panic 被捕获并转为 AgentError::Panicked
    async fn run_rounds(&mut self, cycle: &mut Cycle) -> (Result<(), AgentError>, CycleOutcome) {
        let mut runner = CycleRunner {
            generator: self.generator.as_ref(),
            memory: &self.memory,
            compressor: &self.compressor,
            planner: &self.planner,
            router: &self.router,
            critic: &self.critic,
            executor: &self.executor,
            supervisor: &self.supervisor,
            retry: &self.retry,
            state: &mut self.state,
            metrics: &mut self.metrics,
            settings: &self.settings,
            event_tx: self.event_tx.as_ref(),
            outcome: CycleOutcome::default(),
        };
        let result = match AssertUnwindSafe(runner.run(cycle)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(AgentError::Panicked(message))
            }
        };
        (result, runner.outcome)
    }

    fn record_transition(&mut self, from: CycleState, to: CycleState) {
        self.metrics.log_transition(from, to);
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(CycleEvent::StateChanged { from, to });
        }
    }

    fn finalize(&mut self, cycle: &Cycle, progress: CycleOutcome) -> FinalResult {
        let confidence = self.confidence.calculate_score(
            progress.critic_severity,
            progress.tool_success,
            cycle.refinement_count,
            MODEL_CERTAINTY,
        );
        let metadata = ConfidenceMetadata {
            confidence,
            tools_used: progress.tools_used.clone(),
            iterations: cycle.rounds(),
            model: progress.model.clone(),
            learning_mode: self.learning_mode,
        };
        let result = self.confidence.wrap_response(&progress.answer, metadata);
        self.end_request(cycle, &progress, confidence, CycleState::Completed);
        result
    }

    fn fail(&mut self, cycle: &Cycle, err: AgentError, progress: CycleOutcome) -> FinalResult {
        tracing::error!(cycle = %cycle.id, error = %err, kind = err.kind().as_str(), "cycle failed");

        if let Ok((from, to)) = self.state.transition(CycleState::Recovering) {
            self.record_transition(from, to);
        }
        let fallback = self.recovery.fallback_result(&err);
        if let Some((from, to)) = self.state.fail() {
            self.record_transition(from, to);
        }

        let result = FinalResult {
            answer: fallback.output,
            confidence: 0.0,
            production_ready: false,
            state: CycleState::Failed,
            error_type: Some(fallback.error_type),
            metadata: ConfidenceMetadata {
                confidence: 0.0,
                tools_used: progress.tools_used.clone(),
                iterations: cycle.rounds(),
                model: progress.model.clone(),
                learning_mode: self.learning_mode,
            },
        };
        self.end_request(cycle, &progress, 0.0, CycleState::Failed);
        result
    }

    fn end_request(&mut self, cycle: &Cycle, progress: &CycleOutcome, confidence: f64, final_state: CycleState) {
        let log = self.metrics.end_request(RequestMetadata {
            cycle_id: cycle.id.to_string(),
            intent: cycle.initial_input.clone(),
            tools_selected: progress.tools_used.clone(),
            model_used: progress.model.clone(),
            confidence,
            retry_count: cycle.refinement_count,
            depth: cycle.depth,
            final_state: Some(final_state),
        });
        self.last_log = Some(log);
    }

    /// 幂等关闭：输出会话摘要，然后按顺序释放语义索引与生成后端；重复调用返回 None
    pub async fn shutdown(&self) -> Option<SessionSummary> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.supervisor.cancel_generation();
        let summary = self.stats.summary();
        tracing::info!("{}", summary.render());

        let mut coordinator = ShutdownCoordinator::new();
        coordinator.register(IndexCleanup::new(self.memory.index()));
        coordinator.register(GeneratorCleanup::new(Arc::clone(&self.generator)));
        coordinator.run_cleanup().await;
        Some(summary)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 透传外部资源采样
    pub fn get_resource_usage(&self) -> ResourceUsage {
        self.monitor.usage()
    }

    /// 中断当前生成的句柄（可在其他任务中调用）
    pub fn cancel_handle(&self) -> Arc<SessionSupervisor> {
        Arc::clone(&self.supervisor)
    }

    pub fn state(&self) -> CycleState {
        self.state.current()
    }

    /// 最近一个 Cycle 的结构化日志
    pub fn last_request_log(&self) -> Option<&RequestLog> {
        self.last_log.as_ref()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn summary(&self) -> SessionSummary {
        self.stats.summary()
    }
}
