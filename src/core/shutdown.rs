//! 优雅关闭
//!
//! 统一监听关闭信号（Ctrl+C / SIGTERM / 网关断开），退出前按注册顺序执行清理：
//! 运行登记表最后落盘一次、停止后台任务、关闭网关连接。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::gateway::WsGatewayClient;
use crate::subagent::SubagentRegistry;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 网关连接断开
    GatewayLost,
}

/// 关闭信号：只记录第一次触发的原因
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, shutting down");
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
                    tracing::info!("Received SIGTERM, shutting down");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，单个任务失败或超时不影响后续任务
pub struct ShutdownCoordinator {
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            task_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    /// 返回成功完成的任务数
    pub async fn run_cleanup(&self) -> usize {
        let mut completed = 0;
        for task in &self.tasks {
            match tokio::time::timeout(self.task_timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup '{}' done", task.name());
                    completed += 1;
                }
                Ok(Err(e)) => tracing::warn!("Cleanup '{}' failed: {:#}", task.name(), e),
                Err(_) => tracing::warn!(
                    "Cleanup '{}' timed out after {:?}",
                    task.name(),
                    self.task_timeout
                ),
            }
        }
        completed
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 把运行登记表落盘并停止监听与清扫任务
pub struct RegistryFlushCleanup {
    registry: SubagentRegistry,
}

impl RegistryFlushCleanup {
    pub fn new(registry: SubagentRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for RegistryFlushCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.registry.flush().await?;
        self.registry.shutdown();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SubagentRegistry"
    }
}

/// 关闭网关连接
pub struct GatewayCloseCleanup {
    client: Arc<WsGatewayClient>,
}

impl GatewayCloseCleanup {
    pub fn new(client: Arc<WsGatewayClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for GatewayCloseCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.client.close();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Gateway"
    }
}

/// 运行守护任务直到其结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F>(
    manager: Arc<ShutdownManager>,
    daemon: F,
    coordinator: ShutdownCoordinator,
) -> Option<ShutdownReason>
where
    F: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = daemon => tracing::info!("Daemon task finished"),
        _ = manager.wait_for_shutdown() => {
            tracing::info!("Shutdown requested: {:?}", manager.reason());
        }
    }

    coordinator.run_cleanup().await;
    manager.reason()
}
