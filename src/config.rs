//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ARON__*` 覆盖（双下划线表示嵌套，如 `ARON__CYCLE__MAX_DEPTH=3`）。
//! 每个段、每个字段都有默认值，配置文件可以只写需要覆盖的键。

use std::path::PathBuf;

use serde::Deserialize;

use crate::react::actions::ReplayOrder;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub cycle: CycleSection,
    pub critic: CriticSection,
    pub memory: MemorySection,
    pub router: RouterSection,
    pub tools: ToolsSection,
    pub recovery: RecoverySection,
}

/// [app] 段：应用名、项目根目录、学习模式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 文件写入与 shell 的工作目录，未设置时用当前目录
    pub project_root: Option<PathBuf>,
    /// 回复末尾附带推理摘要
    pub learning_mode: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "aron".to_string(),
            project_root: None,
            learning_mode: false,
        }
    }
}

impl AppSection {
    pub fn resolved_project_root(&self) -> PathBuf {
        self.project_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// [llm] 段：后端地址与生成参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// OpenAI 兼容端点（如 http://127.0.0.1:8080/v1）；未设置时使用离线 scripted 后端
    pub base_url: Option<String>,
    /// 保存 API Key 的环境变量名
    pub api_key_env: Option<String>,
    pub fast_model: String,
    pub heavy_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop_sequences: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: Some("ARON_API_KEY".to_string()),
            fast_model: "qwen2.5-coder-1.5b-instruct".to_string(),
            heavy_model: "deepseek-coder-v2-lite-instruct".to_string(),
            max_tokens: 1024,
            temperature: 0.2,
            stop_sequences: vec![
                "<|im_end|>".to_string(),
                "<|endoftext|>".to_string(),
                "<｜User｜>".to_string(),
                "\nUser:".to_string(),
            ],
            request_timeout_secs: 120,
        }
    }
}

/// [cycle] 段：深度、修正次数、动作回放
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CycleSection {
    /// 动作结果触发的追加轮次上限
    pub max_depth: usize,
    /// Critic 触发的修正轮次上限
    pub max_refinement: usize,
    /// 回灌给下一轮的动作结果最大字符数
    pub feedback_char_budget: usize,
    pub replay_order: ReplayOrder,
}

impl Default for CycleSection {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_refinement: 2,
            feedback_char_budget: 2000,
            replay_order: ReplayOrder::default(),
        }
    }
}

/// [critic] 段：有效性与修正阈值（独立配置）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CriticSection {
    pub validity_threshold: f64,
    pub refinement_threshold: f64,
}

impl Default for CriticSection {
    fn default() -> Self {
        Self {
            validity_threshold: 0.5,
            refinement_threshold: 0.5,
        }
    }
}

/// [memory] 段：短期 / 长期 / 项目记忆与上下文压缩
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub short_term_capacity: usize,
    /// 组合上下文中展示的最近轮数
    pub short_term_window: usize,
    pub long_term_top_k: usize,
    /// 每条检索片段最大字符数
    pub snippet_chars: usize,
    /// 相对项目根的项目记忆文件
    pub project_files: Vec<String>,
    pub project_chars: usize,
    /// ContextCompressor 的 token 预算
    pub context_max_tokens: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            short_term_capacity: 10,
            short_term_window: 5,
            long_term_top_k: 3,
            snippet_chars: 500,
            project_files: vec!["README.md".to_string()],
            project_chars: 2000,
            context_max_tokens: 4000,
        }
    }
}

/// [router] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// 上下文超过该字符数时切换到重型模型
    pub heavy_context_chars: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            heavy_context_chars: 10_000,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单条 shell 命令超时（秒）
    pub shell_timeout_secs: u64,
    /// 有文件写入成功后，按项目清单（Cargo.toml / pubspec.yaml 等）追加一次检查命令
    pub validate_after_write: bool,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            shell_timeout_secs: 30,
            validate_after_write: true,
        }
    }
}

/// [recovery] 段：瞬时错误退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_jitter_ms: 1000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 ARON__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ARON__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, skipping");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ARON")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 加载失败时记录警告并回退到默认配置
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    })
}
