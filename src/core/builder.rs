//! 控制器构建器：统一的初始化逻辑
//!
//! CLI 与测试走同一条路径；未注入的协作者按配置给出默认实现：
//! 设置了 llm.base_url 时使用 OpenAI 兼容后端，否则使用离线 scripted 后端；
//! 语义索引默认为空实现，shell / 文件写入限定在项目根目录内，确认走终端交互；
//! tools.validate_after_write 打开时，执行器在文件写入成功后追加项目检查。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::AppConfig;
use crate::core::orchestrator::{AgentCycleController, ControllerParts};
use crate::core::recovery::RetryPolicy;
use crate::core::AgentError;
use crate::llm::{Generator, OpenAiCompatGenerator, ScriptedGenerator, ToolRouter};
use crate::memory::{ContextCompressor, NoopIndex, SemanticIndex};
use crate::observability::{ResourceMonitor, SysinfoMonitor};
use crate::react::loop_::CycleSettings;
use crate::react::{CycleEvent, MemoryManager, SelfCritic};
use crate::tools::{
    ActionExecutor, ConfirmationGate, FileWriter, LocalShell, ProjectValidator, SafeFs, ShellRunner, StdinConfirm,
};

pub struct ControllerBuilder {
    config: AppConfig,
    generator: Option<Arc<dyn Generator>>,
    index: Option<Arc<dyn SemanticIndex>>,
    shell: Option<Arc<dyn ShellRunner>>,
    files: Option<Arc<dyn FileWriter>>,
    gate: Option<Arc<dyn ConfirmationGate>>,
    monitor: Option<Box<dyn ResourceMonitor>>,
    event_tx: Option<UnboundedSender<CycleEvent>>,
}

impl ControllerBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            generator: None,
            index: None,
            shell: None,
            files: None,
            gate: None,
            monitor: None,
            event_tx: None,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn SemanticIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_shell(mut self, shell: Arc<dyn ShellRunner>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_file_writer(mut self, files: Arc<dyn FileWriter>) -> Self {
        self.files = Some(files);
        self
    }

    /// 确认关卡（非交互场景注入 StaticConfirm）
    pub fn with_confirmation(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_monitor(mut self, monitor: Box<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// 订阅状态变化、流式文本与动作事件
    pub fn with_event_sender(mut self, tx: UnboundedSender<CycleEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn project_root(&self) -> PathBuf {
        self.config.app.resolved_project_root()
    }

    /// 按配置构建生成后端
    pub fn build_generator(&self) -> Result<Arc<dyn Generator>, AgentError> {
        match OpenAiCompatGenerator::from_config(&self.config.llm)? {
            Some(generator) => {
                tracing::info!(model = %self.config.llm.fast_model, "using OpenAI-compatible generator");
                Ok(Arc::new(generator))
            }
            None => {
                tracing::warn!("llm.base_url not set, falling back to offline scripted generator");
                Ok(Arc::new(ScriptedGenerator::echo_offline()))
            }
        }
    }

    pub fn build(self) -> Result<AgentCycleController, AgentError> {
        let cfg = &self.config;
        let project_root = self.project_root();
        let retry = RetryPolicy::from_config(&cfg.recovery);

        let generator = match self.generator.clone() {
            Some(g) => g,
            None => self.build_generator()?,
        };
        let index = self.index.unwrap_or_else(|| Arc::new(NoopIndex));
        let shell = self
            .shell
            .unwrap_or_else(|| Arc::new(LocalShell::new(project_root.clone())));
        let files = self
            .files
            .unwrap_or_else(|| Arc::new(SafeFs::new(&project_root)));
        let gate = self.gate.unwrap_or_else(|| Arc::new(StdinConfirm));
        let monitor = self
            .monitor
            .unwrap_or_else(|| Box::new(SysinfoMonitor::new()));
        let mut executor = ActionExecutor::new(shell, files, gate, cfg.tools.shell_timeout_secs);
        if cfg.tools.validate_after_write {
            executor = executor.with_validator(ProjectValidator::new(&project_root));
        }

        let parts = ControllerParts {
            generator,
            memory: MemoryManager::new(cfg.memory.clone(), index, retry.clone()),
            compressor: ContextCompressor::new(cfg.memory.context_max_tokens),
            router: ToolRouter::from_config(&cfg.llm, &cfg.router),
            critic: SelfCritic::from_config(&cfg.critic),
            executor,
            monitor,
            retry,
            settings: CycleSettings::from_config(&cfg.cycle, &cfg.llm),
            project_root,
            learning_mode: cfg.app.learning_mode,
            event_tx: self.event_tx,
        };
        AgentCycleController::from_parts(parts)
    }
}

/// 按配置创建控制器（全部使用默认协作者）
pub fn create_controller(config: AppConfig) -> Result<AgentCycleController, AgentError> {
    ControllerBuilder::new(config).build()
}
