//! Aron - 本地编码助手的 Agent Cycle 控制器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机、错误与恢复、置信度、指标、会话监管、关闭流程、Cycle 控制器
//! - **llm**: 生成后端抽象与实现（OpenAI 兼容流式 / Scripted）、模型与工具路由
//! - **memory**: 短期会话记忆、语义索引、上下文压缩
//! - **observability**: tracing 初始化与资源采样
//! - **react**: Planner、Critic、动作提取、记忆协调与回合循环
//! - **tools**: shell、受限文件写入、人工确认与动作执行器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{AgentCycleController, ControllerBuilder, CycleState, FinalResult};
