//! 非关键副作用（遥测、远端会话删除等）
//!
//! 失败只记录日志，不向调用方传播。

use std::future::Future;

use tokio::task::JoinHandle;

/// 在后台执行一个尽力而为的副作用；错误以 warn 级别记录后丢弃
pub fn spawn_best_effort<F>(label: &'static str, effect: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = effect.await {
            tracing::warn!("Best-effort {} failed: {:#}", label, e);
        }
    })
}
