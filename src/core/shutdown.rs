//! 优雅关闭处理
//!
//! ShutdownManager 监听 Ctrl+C / SIGTERM 并取消关闭 token；主循环在 select! 中等待它，
//! 然后调用控制器的 shutdown()。ShutdownCoordinator 按注册顺序执行清理任务，每个任务带超时：
//! 先释放语义索引，再释放生成后端。

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::llm::Generator;
use crate::memory::SemanticIndex;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C 或 exit 命令
    UserInitiated,
    /// SIGTERM
    Signal,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取关闭 token（用于取消正在进行的 Cycle）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 每个清理任务的超时时间（秒）
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 依次执行；单个任务失败或超时只记录日志，不影响后续任务。返回完成的任务名
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);
        let mut completed = Vec::new();

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                    completed.push(name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
        completed
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 语义索引释放
pub struct IndexCleanup {
    index: Arc<dyn SemanticIndex>,
}

impl IndexCleanup {
    pub fn new(index: Arc<dyn SemanticIndex>) -> Self {
        Self { index }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for IndexCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.index.release().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SemanticIndex"
    }
}

/// 生成后端释放
pub struct GeneratorCleanup {
    generator: Arc<dyn Generator>,
}

impl GeneratorCleanup {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for GeneratorCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.generator.release().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Generator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let mut reasons = manager.subscribe();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::Signal);
        assert!(token.is_cancelled());
        assert_eq!(reasons.try_recv().unwrap(), ShutdownReason::Signal);
    }

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for Recording {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_in_order_and_survives_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = ShutdownCoordinator::new().with_timeout(1);
        coordinator.register(Recording {
            name: "first",
            log: log.clone(),
            fail: true,
        });
        coordinator.register(Recording {
            name: "second",
            log: log.clone(),
            fail: false,
        });
        let completed = coordinator.run_cleanup().await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(completed, vec!["second"]);
    }
}
