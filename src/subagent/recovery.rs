//! 重启恢复
//!
//! 启动时从磁盘加载登记表，接管上一个进程留下的运行：
//! 已完成清理的不动，已结束的直接进入通知/清理，未结束的重新发起完成等待。
//! 已派生出重试但原记录还没移除的，直接移除原记录，由重试运行负责通知。

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::registry::SubagentRegistry;
use super::run::{CleanupMode, SubagentRun};
use super::store::RunMap;
use crate::core::spawn_best_effort;
use crate::gateway::delete_session;

impl SubagentRegistry {
    /// 每个实例只执行一次，重复调用直接返回
    pub async fn restore(&self) {
        if self.inner.restored.swap(true, Ordering::SeqCst) {
            return;
        }

        let loaded = match self.inner.store.load() {
            Ok(runs) => runs,
            Err(e) => {
                tracing::warn!("Failed to load subagent registry, starting empty: {}", e);
                return;
            }
        };

        let (pending, superseded, has_archived) = {
            let mut runs = self.inner.runs.lock().await;
            let mut adopted_ids = HashSet::new();
            let mut released = 0usize;
            for (run_id, mut run) in loaded {
                // 内存中已有的记录优先
                if runs.contains_key(&run_id) {
                    continue;
                }
                // 上个进程认领后没来得及收尾
                if run.cleanup_handled && run.cleanup_completed_at.is_none() {
                    run.cleanup_handled = false;
                    released += 1;
                }
                adopted_ids.insert(run_id.clone());
                runs.insert(run_id, run);
            }
            let superseded = take_superseded(&mut runs, &adopted_ids);
            if released > 0 || !superseded.is_empty() {
                self.persist(&runs);
            }
            if !adopted_ids.is_empty() {
                tracing::info!(
                    "Restored {} subagent runs from disk ({} stale claims released, {} superseded by retries)",
                    adopted_ids.len(),
                    released,
                    superseded.len()
                );
            }
            let has_archived = runs.values().any(|run| run.archive_at_ms.is_some());
            (runs.values().cloned().collect::<Vec<_>>(), superseded, has_archived)
        };

        for run in superseded {
            if run.cleanup == CleanupMode::Delete {
                let gateway = Arc::clone(&self.inner.gateway);
                spawn_best_effort("superseded child session delete", async move {
                    delete_session(gateway.as_ref(), &run.child_session_key).await?;
                    Ok(())
                });
            }
        }

        if pending.is_empty() {
            return;
        }
        self.ensure_listener();
        if has_archived {
            self.ensure_sweeper();
        }
        for run in pending {
            self.resume_run(run);
        }
    }

    /// 按记录状态接续处理；每个 runId 只接续一次
    fn resume_run(&self, run: SubagentRun) {
        if !self.mark_resumed(&run.run_id) {
            return;
        }
        if run.is_cleanup_completed() {
            return;
        }
        if run.is_ended() {
            let registry = self.clone();
            tokio::spawn(async move {
                registry.run_cleanup_flow(&run.run_id).await;
            });
            return;
        }
        let timeout_ms = self.wait_timeout_ms(&run);
        self.spawn_completion_wait(run.run_id, timeout_ms);
    }
}

/// 移出已被重试接替的原记录：retryHandled 已置位且登记表里有 retryOf 指向它的运行
///
/// 只处理本次从磁盘接管的记录。
fn take_superseded(runs: &mut RunMap, adopted: &HashSet<String>) -> Vec<SubagentRun> {
    let retried: HashSet<String> = runs
        .values()
        .filter_map(|run| run.retry_of.clone())
        .collect();
    let ids: Vec<String> = runs
        .values()
        .filter(|run| adopted.contains(&run.run_id))
        .filter(|run| run.retry_handled && !run.is_cleanup_completed())
        .filter(|run| retried.contains(&run.run_id))
        .map(|run| run.run_id.clone())
        .collect();
    ids.iter().filter_map(|id| runs.remove(id)).collect()
}
