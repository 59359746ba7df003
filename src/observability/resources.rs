//! 进程资源采样（内存 / CPU），供 UI 显示；控制器只做透传，不参与计算

use std::sync::Mutex;

use serde::Serialize;
use sysinfo::{Pid, System};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct ResourceUsage {
    pub ram_mb: f64,
    pub cpu_percent: f32,
}

pub trait ResourceMonitor: Send + Sync {
    fn usage(&self) -> ResourceUsage;
}

/// 基于 sysinfo 的当前进程采样
pub struct SysinfoMonitor {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoMonitor {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::warn!(error = %e, "current pid unavailable, resource usage disabled"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor for SysinfoMonitor {
    fn usage(&self) -> ResourceUsage {
        let Some(pid) = self.pid else {
            return ResourceUsage::default();
        };
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_process(pid);
        system
            .process(pid)
            .map(|p| ResourceUsage {
                ram_mb: p.memory() as f64 / (1024.0 * 1024.0),
                cpu_percent: p.cpu_usage(),
            })
            .unwrap_or_default()
    }
}

/// 固定读数（测试用）
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedMonitor(pub ResourceUsage);

impl ResourceMonitor for FixedMonitor {
    fn usage(&self) -> ResourceUsage {
        self.0
    }
}
