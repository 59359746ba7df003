//! Cycle 回合循环
//!
//! 每一轮：Analyzing（组装并压缩上下文）→ Planning → Routing → Executing（流式生成、提取并执行动作）
//! → Verifying（仅有动作时，整理动作结果；有文件写入成功时追加项目检查）→ Critiquing，然后三选一：
//! - Critic 要求修正且修正预算未用完 → Refining，缺陷描述（加上动作结果）作为下一轮输入
//! - 本轮有已执行动作且深度预算未用完 → 下一轮，动作结果作为输入
//! - 否则 Completed
//!
//! 两个预算都在继续之前检查，然后才递增。每次状态转移都在该阶段执行前记录。
//! 可选 event_tx：向 CLI 推送 StateChanged / Chunk / ActionProposed / ActionResult / Critique。

use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{CycleSection, LlmSection};
use crate::core::recovery::{retry_with_backoff_if, RetryPolicy};
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::state::{Cycle, CycleState, StateTracker};
use crate::core::{AgentError, MetricsTracker};
use crate::llm::{find_stop, GenerationRequest, Generator, LlmError, RoutingDecision, ToolRouter};
use crate::memory::{ContextCompressor, Message};
use crate::react::actions::{
    build_feedback, execution_order, ActionKind, ActionParser, ActionPayload, ActionRequest, ReplayOrder,
};
use crate::react::{CriticFeedback, CycleEvent, MemoryManager, SelfCritic, TaskPlanner};
use crate::tools::ActionExecutor;

/// ActionResult 事件中的预览长度
const RESULT_PREVIEW_CHARS: usize = 300;

const SYSTEM_PREAMBLE: &str = "You are Aron, a local coding assistant working inside the user's project.\n\
To run a command, write <shell>command</shell>.\n\
To create or replace a file, write <file path=\"relative/path\">full file content</file>.\n\
Every action is shown to the user for confirmation before it runs.";

/// 回合循环参数（来自 [cycle] 与 [llm]）
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub max_depth: usize,
    pub max_refinement: usize,
    pub feedback_char_budget: usize,
    pub replay_order: ReplayOrder,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop_sequences: Vec<String>,
}

impl CycleSettings {
    pub fn from_config(cycle: &CycleSection, llm: &LlmSection) -> Self {
        Self {
            max_depth: cycle.max_depth,
            max_refinement: cycle.max_refinement,
            feedback_char_budget: cycle.feedback_char_budget,
            replay_order: cycle.replay_order,
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            stop_sequences: llm.stop_sequences.clone(),
        }
    }
}

/// 运行过程中累积的结果；出错时控制器仍可读取已有部分
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub answer: String,
    /// 最后一次 Critic 的严重度
    pub critic_severity: f64,
    /// 已执行动作的种类（按执行顺序，可重复）
    pub tools_used: Vec<String>,
    /// 所有已执行动作都成功（没有执行任何动作时为 true）
    pub tool_success: bool,
    pub model: String,
    pub cancelled: bool,
}

/// 一次生成的结果
struct Generation {
    text: String,
    actions: Vec<ActionRequest>,
    cancelled: bool,
}

/// 回合循环所需的全部协作者（均借自控制器）
pub struct CycleRunner<'a> {
    pub generator: &'a dyn Generator,
    pub memory: &'a MemoryManager,
    pub compressor: &'a ContextCompressor,
    pub planner: &'a TaskPlanner,
    pub router: &'a ToolRouter,
    pub critic: &'a SelfCritic,
    pub executor: &'a ActionExecutor,
    pub supervisor: &'a SessionSupervisor,
    pub retry: &'a RetryPolicy,
    pub state: &'a mut StateTracker,
    pub metrics: &'a mut MetricsTracker,
    pub settings: &'a CycleSettings,
    pub event_tx: Option<&'a UnboundedSender<CycleEvent>>,
    pub outcome: CycleOutcome,
}

impl<'a> CycleRunner<'a> {
    fn emit(&self, event: CycleEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// 查表转移，记录并推送；在该阶段执行前调用
    fn enter(&mut self, to: CycleState) -> Result<(), AgentError> {
        let (from, to) = self.state.transition(to)?;
        self.metrics.log_transition(from, to);
        self.emit(CycleEvent::StateChanged { from, to });
        Ok(())
    }

    pub async fn run(&mut self, cycle: &mut Cycle) -> Result<(), AgentError> {
        self.outcome.tool_success = true;
        cycle.history.push(Message::user(cycle.initial_input.clone()));

        loop {
            self.enter(CycleState::Analyzing)?;
            let context = self
                .memory
                .get_combined_context(&cycle.current_input)
                .await;
            let context = self.compressor.compress(&context);

            self.enter(CycleState::Planning)?;
            let plan = self.planner.create_plan(&cycle.initial_input, &context);

            self.enter(CycleState::Routing)?;
            let routing = self.router.route(&cycle.initial_input, &context);
            tracing::debug!(
                cycle = %cycle.id,
                complexity = plan.complexity.as_str(),
                tool = routing.primary_tool.as_str(),
                model = %routing.selected_model,
                "round routed"
            );
            self.outcome.model = routing.selected_model.clone();

            self.enter(CycleState::Executing)?;
            let prompt = build_prompt(&context, &plan.to_prompt_section(), &routing, cycle);
            let generation = self.generate(prompt, &routing).await?;
            self.outcome.cancelled |= generation.cancelled;
            cycle.history.push(Message::assistant(generation.text.clone()));
            self.outcome.answer = generation.text.clone();

            let mut actions = generation.actions;
            for action in &actions {
                self.emit(CycleEvent::ActionProposed {
                    index: action.index,
                    action: action.payload.clone(),
                });
            }
            self.execute_actions(&mut actions).await;

            let feedback = if actions.is_empty() {
                None
            } else {
                self.enter(CycleState::Verifying)?;
                let feedback =
                    build_feedback(&actions, self.settings.replay_order, self.settings.feedback_char_budget);
                match (feedback, self.validate_changes(&actions).await) {
                    (Some(feedback), Some(report)) => Some(format!("{feedback}\n\n{report}")),
                    (feedback, report) => feedback.or(report),
                }
            };

            self.enter(CycleState::Critiquing)?;
            let verdict = self.critic.evaluate(&cycle.current_input, &generation.text);
            let wants_refinement = self.critic.needs_refinement(&verdict);
            self.outcome.critic_severity = verdict.severity_score;
            self.emit(CycleEvent::Critique {
                severity: verdict.severity_score,
                flaws: verdict.flaws.clone(),
                needs_refinement: wants_refinement,
            });

            if wants_refinement && cycle.refinement_count < self.settings.max_refinement {
                self.enter(CycleState::Refining)?;
                cycle.refinement_count += 1;
                cycle.current_input = refinement_input(&verdict, feedback.as_deref());
                cycle.history.push(Message::user(cycle.current_input.clone()));
                tracing::info!(
                    cycle = %cycle.id,
                    refinement = cycle.refinement_count,
                    severity = verdict.severity_score,
                    "refining response"
                );
                continue;
            }

            match feedback {
                Some(feedback) if cycle.depth < self.settings.max_depth => {
                    cycle.depth += 1;
                    cycle.current_input = feedback;
                    cycle.history.push(Message::user(cycle.current_input.clone()));
                    tracing::info!(cycle = %cycle.id, depth = cycle.depth, "follow-up round with action results");
                }
                _ => {
                    self.enter(CycleState::Completed)?;
                    return Ok(());
                }
            }
        }
    }

    /// 流式生成：打开流时对瞬时错误退避重试；收集时在客户端再次应用 stop sequence，
    /// 并同步喂给动作解析器。用户取消时，已收到的部分（可能为空）即为完整回复。
    async fn generate(&mut self, prompt: String, routing: &RoutingDecision) -> Result<Generation, AgentError> {
        let request = GenerationRequest {
            prompt,
            model: routing.selected_model.clone(),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            stop_sequences: self.settings.stop_sequences.clone(),
        };
        let generator = self.generator;
        // token 先于打开流签发：打开流与退避等待期间的取消同样生效
        let token = self.supervisor.begin_generation();
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            stream = retry_with_backoff_if(
                self.retry,
                "generator_stream",
                || generator.stream(&request),
                LlmError::is_transient,
            ) => Some(stream?),
        };
        let Some(mut stream) = opened else {
            self.emit(CycleEvent::GenerationCancelled { partial_chars: 0 });
            tracing::info!("generation cancelled before the stream opened");
            return Ok(Generation {
                text: String::new(),
                actions: Vec::new(),
                cancelled: true,
            });
        };

        let mut text = String::new();
        let mut parser = ActionParser::new();
        let mut actions = Vec::new();
        let mut cancelled = false;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    cancelled = true;
                    self.emit(CycleEvent::GenerationCancelled { partial_chars: text.chars().count() });
                    tracing::info!(chars = text.len(), "generation cancelled, keeping partial text");
                    break;
                }
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(Ok(chunk)) => {
                        let fed = text.len();
                        text.push_str(&chunk);
                        match find_stop(&text, &request.stop_sequences) {
                            Some(pos) if pos >= fed => {
                                text.truncate(pos);
                                actions.extend(parser.feed(&text[fed..]));
                                self.emit(CycleEvent::Chunk { text: text[fed..].to_string() });
                                break;
                            }
                            Some(pos) => {
                                // stop sequence 跨越了上一块，重新解析截断后的全文
                                text.truncate(pos);
                                parser = ActionParser::new();
                                actions = parser.feed(&text);
                                break;
                            }
                            None => {
                                actions.extend(parser.feed(&chunk));
                                self.emit(CycleEvent::Chunk { text: chunk });
                            }
                        }
                    }
                    Some(Err(e)) if !text.is_empty() => {
                        tracing::warn!(error = %e, chars = text.len(), "stream broke mid-generation, keeping partial text");
                        break;
                    }
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
        actions.extend(parser.finish());

        Ok(Generation {
            text,
            actions,
            cancelled,
        })
    }

    /// 按 ReplayOrder 逐个确认并执行（阻塞直到完成或超时）
    async fn execute_actions(&mut self, actions: &mut [ActionRequest]) {
        for i in execution_order(actions, self.settings.replay_order) {
            let action = &mut actions[i];
            let outcome = self.executor.process(action).await;
            let event = match &outcome {
                Some(o) => CycleEvent::ActionResult {
                    index: action.index,
                    declined: false,
                    success: o.success,
                    preview: o.report.chars().take(RESULT_PREVIEW_CHARS).collect(),
                },
                None => CycleEvent::ActionResult {
                    index: action.index,
                    declined: true,
                    success: false,
                    preview: String::new(),
                },
            };
            if let Some(o) = &outcome {
                let kind = match action.kind() {
                    ActionKind::Shell => "shell",
                    ActionKind::FileWrite => "file_write",
                };
                self.outcome.tools_used.push(kind.to_string());
                self.outcome.tool_success &= o.success;
            }
            self.emit(event);
        }
    }

    /// 本轮至少有一次文件写入成功时，按项目清单追加一条检查命令；
    /// 同样经过确认关卡，拒绝或无可用命令时返回 None
    async fn validate_changes(&mut self, actions: &[ActionRequest]) -> Option<String> {
        let executor = self.executor;
        let validator = executor.validator()?;
        let wrote = actions.iter().any(|a| {
            a.kind() == ActionKind::FileWrite && a.result.as_ref().is_some_and(|r| r.success)
        });
        if !wrote {
            return None;
        }
        let (kind, command) = validator.check_command().await?;

        let mut check = ActionRequest::new(
            actions.len(),
            ActionPayload::Shell {
                command: command.to_string(),
            },
        );
        self.emit(CycleEvent::ActionProposed {
            index: check.index,
            action: check.payload.clone(),
        });
        let outcome = executor.process(&mut check).await;
        self.emit(CycleEvent::ActionResult {
            index: check.index,
            declined: outcome.is_none(),
            success: outcome.as_ref().is_some_and(|o| o.success),
            preview: outcome
                .as_ref()
                .map(|o| o.report.chars().take(RESULT_PREVIEW_CHARS).collect())
                .unwrap_or_default(),
        });
        let outcome = outcome?;
        tracing::info!(project = kind.as_str(), command, ok = outcome.success, "post-write validation");
        self.outcome.tools_used.push("validation".to_string());
        self.outcome.tool_success &= outcome.success;

        let report: String = outcome
            .report
            .chars()
            .take(self.settings.feedback_char_budget)
            .collect();
        Some(format!("[VALIDATION] {} project\n{report}", kind.as_str()))
    }
}

fn refinement_input(verdict: &CriticFeedback, feedback: Option<&str>) -> String {
    let mut input = verdict.to_refinement_prompt();
    if let Some(feedback) = feedback {
        input.push_str("\n\n## Action results\n");
        input.push_str(feedback);
    }
    input
}

fn build_prompt(context: &str, plan: &str, routing: &RoutingDecision, cycle: &Cycle) -> String {
    let mut prompt = String::from(SYSTEM_PREAMBLE);
    if !context.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(context);
    }
    prompt.push_str("\n\n");
    prompt.push_str(plan);
    prompt.push('\n');
    prompt.push_str(&routing.to_prompt_section());
    prompt.push_str("\n## Task\n");
    prompt.push_str(&cycle.initial_input);
    if let Some(previous) = cycle.last_response() {
        prompt.push_str("\n\n## Your previous response\n");
        prompt.push_str(previous);
    }
    if cycle.current_input != cycle.initial_input {
        prompt.push_str("\n\n## Feedback from the previous round\n");
        prompt.push_str(&cycle.current_input);
    }
    prompt.push_str("\n\n## Response\n");
    prompt
}
