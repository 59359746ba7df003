//! Cycle 控制器集成测试：scripted 生成后端 + 记录型 shell + 临时项目目录

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aron::config::AppConfig;
use aron::core::{AgentCycleController, AgentError, ControllerBuilder, CycleState};
use aron::llm::{ChunkStream, GenerationRequest, Generator, LlmError, ScriptedGenerator};
use aron::memory::InMemoryIndex;
use aron::observability::{FixedMonitor, ResourceUsage};
use aron::react::CycleEvent;
use aron::tools::{ShellOutput, ShellRunner, StaticConfirm};
use tokio::sync::mpsc;

/// 记录收到的命令，统一返回成功
#[derive(Default)]
struct RecordingShell {
    commands: Mutex<Vec<String>>,
}

impl RecordingShell {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShellRunner for RecordingShell {
    async fn run(&self, command: &str, _timeout: Duration) -> Result<ShellOutput, AgentError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(ShellOutput {
            success: true,
            stdout: format!("ran {command}\n"),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}

/// stream 时直接 panic
struct PanickingGenerator;

#[async_trait]
impl Generator for PanickingGenerator {
    async fn acquire(&self) -> Result<(), LlmError> {
        Ok(())
    }

    async fn stream(&self, _request: &GenerationRequest) -> Result<ChunkStream, LlmError> {
        panic!("backend exploded");
    }

    async fn release(&self) {}

    fn name(&self) -> &str {
        "panicking"
    }
}

fn test_config(root: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.app.project_root = Some(root.to_path_buf());
    cfg.llm.stop_sequences = Vec::new();
    cfg.recovery.max_retries = 2;
    cfg.recovery.base_delay_ms = 0;
    cfg.recovery.max_jitter_ms = 0;
    cfg
}

struct Harness {
    controller: AgentCycleController,
    generator: Arc<ScriptedGenerator>,
    shell: Arc<RecordingShell>,
    index: Arc<InMemoryIndex>,
    events: mpsc::UnboundedReceiver<CycleEvent>,
    _dir: tempfile::TempDir,
}

fn harness(generator: ScriptedGenerator, confirm: StaticConfirm) -> Harness {
    harness_in(tempfile::tempdir().unwrap(), generator, confirm)
}

fn harness_in(dir: tempfile::TempDir, generator: ScriptedGenerator, confirm: StaticConfirm) -> Harness {
    harness_with(dir, generator, confirm, |_| {})
}

fn harness_with(
    dir: tempfile::TempDir,
    generator: ScriptedGenerator,
    confirm: StaticConfirm,
    tweak: impl FnOnce(&mut AppConfig),
) -> Harness {
    let generator = Arc::new(generator);
    let shell = Arc::new(RecordingShell::default());
    let index = Arc::new(InMemoryIndex::new());
    let (tx, events) = mpsc::unbounded_channel();
    let mut cfg = test_config(dir.path());
    tweak(&mut cfg);
    let controller = ControllerBuilder::new(cfg)
        .with_generator(generator.clone())
        .with_index(index.clone())
        .with_shell(shell.clone())
        .with_confirmation(Arc::new(confirm))
        .with_monitor(Box::new(FixedMonitor(ResourceUsage {
            ram_mb: 42.0,
            cpu_percent: 1.5,
        })))
        .with_event_sender(tx)
        .build()
        .unwrap();
    Harness {
        controller,
        generator,
        shell,
        index,
        events,
        _dir: dir,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<CycleEvent>) -> Vec<CycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_plain_answer_completes_in_one_round() {
    let mut h = harness(
        ScriptedGenerator::new(["The parser module tokenizes input before building the tree."]),
        StaticConfirm::always(true),
    );

    let result = h.controller.run_cycle("explain the parser module").await;

    assert!(result.is_success());
    assert_eq!(result.state, CycleState::Completed);
    assert!((result.confidence - 1.0).abs() < 1e-9);
    assert!(result.production_ready);
    assert!(result.answer.starts_with("The parser module tokenizes"));
    assert_eq!(result.metadata.iterations, 1);
    assert!(result.metadata.tools_used.is_empty());
    assert_eq!(h.generator.stream_calls(), 1);
    assert_eq!(h.generator.acquire_count(), 1);
    assert_eq!(h.controller.state(), CycleState::Idle);

    let log = h.controller.last_request_log().unwrap();
    assert_eq!(log.depth, 0);
    assert_eq!(log.retry_count, 0);
    assert_eq!(log.final_state, Some(CycleState::Completed));
    let states: Vec<CycleState> = log.state_transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            CycleState::Analyzing,
            CycleState::Planning,
            CycleState::Routing,
            CycleState::Executing,
            CycleState::Critiquing,
            CycleState::Completed,
        ]
    );
}

#[tokio::test]
async fn test_events_bracket_the_cycle() {
    let mut h = harness(
        ScriptedGenerator::new(["A short but complete answer."]).with_chunk_chars(4),
        StaticConfirm::always(true),
    );
    h.controller.run_cycle("say something").await;

    let events = drain(&mut h.events);
    assert!(matches!(
        events.first(),
        Some(CycleEvent::StateChanged {
            from: CycleState::Idle,
            to: CycleState::Analyzing
        })
    ));
    assert!(matches!(events.last(), Some(CycleEvent::Done { .. })));
    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            CycleEvent::Chunk { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "A short but complete answer.");
}

#[tokio::test]
async fn test_refinement_is_bounded() {
    // 两个泄漏 token，严重度 1.0，每一轮都要求修正
    let mut h = harness(
        ScriptedGenerator::new(["<|im_end|> here is the answer <|endoftext|>"]),
        StaticConfirm::always(true),
    );

    let result = h.controller.run_cycle("list the files").await;

    assert_eq!(result.state, CycleState::Completed);
    assert_eq!(h.generator.stream_calls(), 3);
    assert_eq!(result.metadata.iterations, 3);
    // 1.0 - 0.5 * 1.0 - 0.1 * 2
    assert!((result.confidence - 0.3).abs() < 1e-9);
    assert!(!result.production_ready);
    assert_eq!(h.controller.last_request_log().unwrap().retry_count, 2);

    let requests = h.generator.requests();
    assert!(!requests[0].prompt.contains("Your previous response had these problems"));
    assert!(requests[1].prompt.contains("Your previous response had these problems"));
    assert!(requests[1].prompt.contains("<|im_end|>"));
    assert!(!requests[0].prompt.contains("## Your previous response"));
    assert!(requests[1]
        .prompt
        .contains("## Your previous response\n<|im_end|> here is the answer <|endoftext|>"));
}

#[tokio::test]
async fn test_declined_actions_end_the_cycle() {
    let mut h = harness(
        ScriptedGenerator::new(["Let me look around.\n<shell>ls -la</shell>", "unused follow-up"]),
        StaticConfirm::always(false),
    );

    let result = h.controller.run_cycle("show me the project").await;

    assert!(result.is_success());
    assert_eq!(h.generator.stream_calls(), 1);
    assert!(h.shell.commands().is_empty());
    assert!(result.metadata.tools_used.is_empty());

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        CycleEvent::ActionResult { declined: true, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        CycleEvent::StateChanged {
            to: CycleState::Verifying,
            ..
        }
    )));
}

#[tokio::test]
async fn test_action_results_drive_follow_up_round() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let mut h = harness_in(
        dir,
        ScriptedGenerator::new([
            "I will write the notes and check them.\n<file path=\"notes.txt\">hello</file>\n<shell>cat notes.txt</shell>",
            "All done, the notes file is in place.",
        ]),
        StaticConfirm::always(true),
    );

    let result = h.controller.run_cycle("create a notes file").await;

    assert!(result.is_success());
    assert_eq!(h.generator.stream_calls(), 2);
    assert_eq!(result.answer, "All done, the notes file is in place.");
    assert_eq!(h.shell.commands(), vec!["cat notes.txt".to_string()]);
    assert_eq!(std::fs::read_to_string(root.join("notes.txt")).unwrap(), "hello");
    // 默认按种类分组：先 shell 后文件
    assert_eq!(
        result.metadata.tools_used,
        vec!["shell".to_string(), "file_write".to_string()]
    );
    assert_eq!(h.controller.last_request_log().unwrap().depth, 1);

    let follow_up = &h.generator.requests()[1].prompt;
    let shell_at = follow_up.find("[SHELL] $ cat notes.txt").unwrap();
    let file_at = follow_up.find("[FILE] notes.txt: wrote 5 bytes").unwrap();
    assert!(follow_up.contains("## Feedback from the previous round"));
    assert!(shell_at < file_at);
}

#[tokio::test]
async fn test_depth_bound_stops_follow_up_rounds() {
    // 每一轮都提出一条会被确认的命令
    let mut h = harness(
        ScriptedGenerator::new(["Checking again.\n<shell>ls</shell>"]),
        StaticConfirm::always(true),
    );

    let result = h.controller.run_cycle("keep looking around").await;

    assert!(result.is_success());
    // 首轮 + max_depth(5) 个后续轮次
    assert_eq!(h.generator.stream_calls(), 6);
    assert_eq!(h.shell.commands().len(), 6);
    assert_eq!(result.metadata.iterations, 6);
    let log = h.controller.last_request_log().unwrap();
    assert_eq!(log.depth, 5);
    assert_eq!(log.retry_count, 0);
    assert_eq!(log.final_state, Some(CycleState::Completed));
}

#[tokio::test]
async fn test_stop_sequence_spanning_chunks() {
    // 后端不截断；"\nUser:" 被切在三个 3 字符的块里，且在 </shell> 之后才完整出现
    let mut h = harness_with(
        tempfile::tempdir().unwrap(),
        ScriptedGenerator::new([
            "Run it.\n<shell>ls</shell>\nUser: also delete <shell>rm notes.txt</shell>",
            "The listing is above, nothing else to run.",
        ])
        .with_chunk_chars(3)
        .ignoring_stop_sequences(),
        StaticConfirm::always(true),
        |cfg| cfg.llm.stop_sequences = vec!["\nUser:".to_string()],
    );

    let result = h.controller.run_cycle("list the files").await;

    assert!(result.is_success());
    assert_eq!(h.shell.commands(), vec!["ls".to_string()]);
    assert_eq!(result.answer, "The listing is above, nothing else to run.");

    let events = drain(&mut h.events);
    let proposed: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            CycleEvent::ActionProposed { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(proposed, vec![0]);

    let follow_up = &h.generator.requests()[1].prompt;
    assert!(follow_up.contains("## Your previous response\nRun it.\n<shell>ls</shell>\n\n"));
    assert!(!follow_up.contains("User:"));
}

#[tokio::test]
async fn test_file_write_triggers_project_check() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n").unwrap();
    let mut h = harness_in(
        dir,
        ScriptedGenerator::new([
            "Adding the helper.\n<file path=\"src/lib.rs\">pub fn add(a: i32, b: i32) -> i32 { a + b }</file>",
            "The helper is in place and the project still checks.",
        ]),
        StaticConfirm::always(true),
    );

    let result = h.controller.run_cycle("add an add helper").await;

    assert!(result.is_success());
    assert_eq!(h.shell.commands(), vec!["cargo check --quiet".to_string()]);
    assert_eq!(
        result.metadata.tools_used,
        vec!["file_write".to_string(), "validation".to_string()]
    );
    let follow_up = &h.generator.requests()[1].prompt;
    let file_at = follow_up.find("[FILE] src/lib.rs: wrote").unwrap();
    let check_at = follow_up.find("[VALIDATION] rust project\n[SHELL] $ cargo check --quiet").unwrap();
    assert!(file_at < check_at);

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        CycleEvent::ActionResult {
            index: 1,
            declined: false,
            success: true,
            ..
        }
    )));
}

#[tokio::test]
async fn test_project_check_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("package.json"), "{}").unwrap();
    let mut h = harness_with(
        dir,
        ScriptedGenerator::new([
            "Writing the entry point.\n<file path=\"index.js\">console.log(1)</file>",
            "The entry point now logs a value.",
        ]),
        StaticConfirm::always(true),
        |cfg| cfg.tools.validate_after_write = false,
    );

    let result = h.controller.run_cycle("add an entry point").await;

    assert!(result.is_success());
    assert!(h.shell.commands().is_empty());
    assert_eq!(result.metadata.tools_used, vec!["file_write".to_string()]);
    assert!(!h.generator.requests()[1].prompt.contains("[VALIDATION]"));
}

#[tokio::test]
async fn test_short_term_memory_keeps_raw_reply() {
    let mut h = harness_with(
        tempfile::tempdir().unwrap(),
        ScriptedGenerator::new(["The build script lives in the tools directory."]),
        StaticConfirm::always(true),
        |cfg| cfg.app.learning_mode = true,
    );

    let first = h.controller.run_cycle("where is the build script").await;
    assert!(first.answer.contains("[ARON REASONING]"));
    h.controller.run_cycle("and the tests?").await;

    let second = &h.generator.requests()[1].prompt;
    assert!(second.contains("assistant: The build script lives in the tools directory."));
    assert!(!second.contains("[ARON REASONING]"));
}

#[tokio::test]
async fn test_failed_cycle_leaves_no_fallback_in_memory() {
    let mut h = harness(
        ScriptedGenerator::new(["never streamed"]).failing_first(
            1,
            LlmError::Api {
                status: 400,
                message: "bad request".to_string(),
            },
        ),
        StaticConfirm::always(true),
    );

    let failed = h.controller.run_cycle("run the linter").await;
    assert_eq!(failed.state, CycleState::Failed);
    h.controller.run_cycle("try again").await;

    let second = &h.generator.requests()[1].prompt;
    assert!(second.contains("user: run the linter"));
    assert!(!second.contains("recovery mode"));
    assert_eq!(h.controller.memory().short_term().len(), 3);
}

#[tokio::test]
async fn test_fatal_backend_error_becomes_fallback() {
    let mut h = harness(
        ScriptedGenerator::new(["never streamed"]).failing_first(
            10,
            LlmError::Api {
                status: 401,
                message: "bad key".to_string(),
            },
        ),
        StaticConfirm::always(true),
    );

    let result = h.controller.run_cycle("run the tests").await;

    assert_eq!(result.state, CycleState::Failed);
    assert_eq!(result.error_type.as_deref(), Some("recovered_fatal_failure"));
    assert_eq!(result.confidence, 0.0);
    assert!(!result.production_ready);
    assert!(result.answer.contains("recovery mode"));
    // 非瞬时错误不重试
    assert_eq!(h.generator.stream_calls(), 1);
    assert_eq!(h.controller.state(), CycleState::Idle);

    let log = h.controller.last_request_log().unwrap();
    let states: Vec<CycleState> = log.state_transitions.iter().map(|t| t.to).collect();
    assert!(states.ends_with(&[CycleState::Recovering, CycleState::Failed]));
    assert_eq!(h.controller.summary().failed, 1);
}

#[tokio::test]
async fn test_transient_backend_error_is_retried() {
    let mut h = harness(
        ScriptedGenerator::new(["Recovered after a flaky connection."])
            .failing_first(1, LlmError::Network("connection reset".to_string())),
        StaticConfirm::always(true),
    );

    let result = h.controller.run_cycle("explain the build").await;

    assert!(result.is_success());
    assert_eq!(h.generator.stream_calls(), 2);
}

#[tokio::test]
async fn test_panicking_round_is_contained() {
    let dir = tempfile::tempdir().unwrap();
    let mut controller = ControllerBuilder::new(test_config(dir.path()))
        .with_generator(Arc::new(PanickingGenerator))
        .with_shell(Arc::new(RecordingShell::default()))
        .with_confirmation(Arc::new(StaticConfirm::always(true)))
        .with_monitor(Box::new(FixedMonitor(ResourceUsage::default())))
        .build()
        .unwrap();

    let result = controller.run_cycle("explain everything").await;

    assert_eq!(result.state, CycleState::Failed);
    assert_eq!(result.error_type.as_deref(), Some("recovered_fatal_failure"));
    assert!(result.answer.contains("backend exploded"));
    assert_eq!(controller.state(), CycleState::Idle);
}

#[tokio::test]
async fn test_cancel_keeps_partial_text() {
    let mut h = harness(
        ScriptedGenerator::new(["Partial answer so far"]).hanging(),
        StaticConfirm::always(true),
    );
    let cancel = h.controller.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel_generation();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), h.controller.run_cycle("write a summary"))
        .await
        .expect("cancelled cycle should finish");

    assert!(result.is_success());
    assert_eq!(result.answer, "Partial answer so far");
    let events = drain(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, CycleEvent::GenerationCancelled { partial_chars: 21 })));
}

#[tokio::test]
async fn test_cancel_before_stream_opens() {
    let mut h = harness(
        ScriptedGenerator::new(["This text arrives too late"])
            .opening_after(Duration::from_millis(300))
            .hanging(),
        StaticConfirm::always(true),
    );
    let cancel = h.controller.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel_generation();
    });

    let result = tokio::time::timeout(Duration::from_secs(3), h.controller.run_cycle("write a summary"))
        .await
        .expect("cancel while opening should finish the cycle");

    assert!(result.is_success());
    assert_eq!(result.answer, "");
    assert_eq!(h.generator.stream_calls(), 1);
    let events = drain(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, CycleEvent::GenerationCancelled { partial_chars: 0 })));
    assert!(!events.iter().any(|e| matches!(e, CycleEvent::Chunk { .. })));
}

#[tokio::test]
async fn test_memory_layers_reach_the_prompt() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("README.md"), "Aron test project readme").unwrap();
    let mut h = harness_in(
        dir,
        ScriptedGenerator::new(["The readme describes a test project."]),
        StaticConfirm::always(true),
    );
    h.index.insert("src/parser.rs", "parser tokens and tree building");

    h.controller.run_cycle("what does the readme say").await;
    h.controller.run_cycle("explain the parser tokens").await;

    let requests = h.generator.requests();
    assert!(requests[0].prompt.contains("[PROJECT CONTEXT]"));
    assert!(requests[0].prompt.contains("Aron test project readme"));
    assert!(!requests[0].prompt.contains("[SHORT-TERM SESSION]"));

    let second = &requests[1].prompt;
    assert!(second.contains("[LONG-TERM MEMORY]"));
    assert!(second.contains("File: src/parser.rs"));
    assert!(second.contains("[SHORT-TERM SESSION]"));
    assert!(second.contains("user: what does the readme say"));
    assert_eq!(h.controller.memory().short_term().len(), 4);
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_releases_once() {
    let mut h = harness(
        ScriptedGenerator::new(["An answer that is long enough."]),
        StaticConfirm::always(true),
    );
    h.controller.run_cycle("explain the layout").await;

    let summary = h.controller.shutdown().await.unwrap();
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.completed, 1);
    assert!((summary.average_confidence - 1.0).abs() < 1e-9);
    assert!(h.controller.shutdown().await.is_none());
    assert!(h.controller.is_closed());
    assert_eq!(h.generator.release_count(), 1);
    assert!(h.index.is_released());

    let after = h.controller.run_cycle("one more").await;
    assert_eq!(after.state, CycleState::Failed);
    assert!(after.answer.contains("shut down"));
    assert_eq!(h.generator.stream_calls(), 1);
}

#[tokio::test]
async fn test_resource_usage_passthrough() {
    let h = harness(ScriptedGenerator::new(["unused"]), StaticConfirm::always(true));
    let usage = h.controller.get_resource_usage();
    assert_eq!(usage.ram_mb, 42.0);
    assert_eq!(usage.cpu_percent, 1.5);
}
