//! 可观测性：tracing 初始化与进程资源采样

pub mod resources;

pub use resources::{FixedMonitor, ResourceMonitor, ResourceUsage, SysinfoMonitor};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志级别由 RUST_LOG 控制，默认 info；`aron::metrics` target 输出每个 Cycle 的 JSON 记录
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
