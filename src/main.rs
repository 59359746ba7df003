//! Aron - 本地编码助手
//!
//! 入口：解析命令行、初始化日志与配置、构建控制器，然后运行单次 chat 或交互式 repl。
//! Ctrl+C / SIGTERM 丢弃当前 Cycle 并执行会话关闭（输出摘要、释放索引与生成后端）。
//! 只中断生成而保留部分回复的取消入口是 AgentCycleController::cancel_handle。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use aron::config::load_config_or_default;
use aron::core::{AgentCycleController, ControllerBuilder, FinalResult, ShutdownManager};
use aron::react::CycleEvent;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

/// Local coding assistant with human-confirmed shell and file actions
#[derive(Parser, Debug)]
#[command(name = "aron")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (overrides config/default.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Project root for shell commands and file writes
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Append a reasoning summary to every answer
    #[arg(long, global = true)]
    learning: bool,

    /// Print the final result as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Print each cycle's state transition trace to stderr
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single cycle
    Chat {
        /// The instruction for the assistant
        #[arg(num_args = 1.., required = true)]
        prompt: Vec<String>,
    },
    /// Interactive session (:usage shows resource usage, :exit quits)
    Repl,
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Commands::Version = cli.command {
        println!("aron {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    aron::observability::init();

    let mut config = load_config_or_default(cli.config.clone());
    if cli.learning {
        config.app.learning_mode = true;
    }
    if let Some(root) = &cli.root {
        config.app.project_root = Some(root.clone());
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(event_rx));

    let mut controller = ControllerBuilder::new(config)
        .with_event_sender(event_tx)
        .build()
        .context("Failed to build controller")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let output = Output {
        json: cli.json,
        trace: cli.trace,
    };
    let outcome = match cli.command {
        Commands::Chat { prompt } => run_chat(&mut controller, &shutdown, &prompt.join(" "), output).await,
        Commands::Repl => run_repl(&mut controller, &shutdown, output).await,
        Commands::Version => Ok(()),
    };

    if let Some(summary) = controller.shutdown().await {
        eprintln!("{}", summary.render());
    }
    drop(controller);
    let _ = printer.await;
    outcome
}

#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
    trace: bool,
}

async fn run_chat(
    controller: &mut AgentCycleController,
    shutdown: &ShutdownManager,
    prompt: &str,
    output: Output,
) -> anyhow::Result<()> {
    // 信号到达时丢弃正在运行的 Cycle（连同其生成流），随后由 main 执行会话关闭
    tokio::select! {
        result = controller.run_cycle(prompt) => print_result(controller, &result, output),
        _ = shutdown.wait_for_shutdown() => eprintln!("\ninterrupted"),
    }
    Ok(())
}

async fn run_repl(
    controller: &mut AgentCycleController,
    shutdown: &ShutdownManager,
    output: Output,
) -> anyhow::Result<()> {
    loop {
        let line = tokio::select! {
            line = read_line() => line?,
            _ = shutdown.wait_for_shutdown() => break,
        };
        let line = line.trim();
        match line {
            "" => continue,
            ":exit" | ":quit" => break,
            ":usage" => {
                let usage = controller.get_resource_usage();
                println!("ram {:.1} MB, cpu {:.1}%", usage.ram_mb, usage.cpu_percent);
                continue;
            }
            _ => {}
        }

        tokio::select! {
            result = controller.run_cycle(line) => print_result(controller, &result, output),
            _ = shutdown.wait_for_shutdown() => {
                eprintln!("\ninterrupted");
                break;
            }
        }
    }
    Ok(())
}

/// dialoguer 的输入是阻塞的，放到阻塞线程池
async fn read_line() -> anyhow::Result<String> {
    let line = tokio::task::spawn_blocking(|| {
        dialoguer::Input::<String>::new()
            .with_prompt("aron")
            .allow_empty(true)
            .interact_text()
    })
    .await
    .context("input task failed")?
    .context("failed to read input")?;
    Ok(line)
}

fn print_result(controller: &AgentCycleController, result: &FinalResult, output: Output) {
    if output.trace {
        if let Some(log) = controller.last_request_log() {
            eprintln!("{}", log.to_json_pretty());
        }
    }
    if output.json {
        println!("{}", result.to_json());
        return;
    }
    println!();
    if !result.is_success() {
        println!("{}", result.answer);
    }
    println!(
        "[{}] confidence {:.2}{}",
        result.state,
        result.confidence,
        if result.production_ready { " (production ready)" } else { "" }
    );
}

/// 流式打印生成文本与动作结果；状态变化只进日志
async fn print_events(mut rx: mpsc::UnboundedReceiver<CycleEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            CycleEvent::StateChanged { from, to } => {
                tracing::debug!(%from, %to, "state changed");
            }
            CycleEvent::Chunk { text } => {
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
            CycleEvent::GenerationCancelled { partial_chars } => {
                println!("\n[generation cancelled after {partial_chars} chars]");
            }
            CycleEvent::ActionProposed { index, action } => {
                println!("\n[action {index}] {}", action.describe());
            }
            CycleEvent::ActionResult {
                index,
                declined,
                success,
                preview,
            } => {
                if declined {
                    println!("[action {index}] declined");
                } else {
                    println!("[action {index}] {}\n{preview}", if success { "ok" } else { "failed" });
                }
            }
            CycleEvent::Critique {
                severity,
                flaws,
                needs_refinement,
            } => {
                if !flaws.is_empty() {
                    tracing::info!(severity, refine = needs_refinement, "critic: {}", flaws.join("; "));
                }
            }
            CycleEvent::Done { .. } => {}
        }
    }
}
