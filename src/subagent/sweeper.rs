//! 归档清扫
//!
//! 有记录带 archiveAtMs 时按固定周期运行，删除到期记录并尽力删除其远端子会话；
//! 登记表为空时自行退出，下次登记需要时再启动。

use tokio::time::{Instant, MissedTickBehavior};

use super::registry::{lock_std, SubagentRegistry};
use super::run::{now_ms, SubagentRun};
use crate::gateway::delete_session;

impl SubagentRegistry {
    /// 确保清扫任务在运行
    pub(crate) fn ensure_sweeper(&self) {
        let mut slot = lock_std(&self.inner.sweeper);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let weak = self.downgrade();
        let period = self.inner.settings.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = SubagentRegistry::upgrade(&weak) else {
                    break;
                };
                registry.sweep_at(now_ms()).await;
                if registry.release_sweeper_if_idle().await {
                    tracing::debug!("Subagent registry empty, archive sweeper stopped");
                    break;
                }
            }
        }));
    }

    /// 删除 archiveAtMs <= now_ms 的记录，返回删除条数
    ///
    /// 远端会话删除在释放锁之后逐条进行，单条失败只记日志。
    pub async fn sweep_at(&self, now_ms: i64) -> usize {
        let expired: Vec<SubagentRun> = {
            let mut runs = self.inner.runs.lock().await;
            let ids: Vec<String> = runs
                .values()
                .filter(|run| run.archive_at_ms.is_some_and(|at| at <= now_ms))
                .map(|run| run.run_id.clone())
                .collect();
            let expired: Vec<SubagentRun> = ids.iter().filter_map(|id| runs.remove(id)).collect();
            if !expired.is_empty() {
                self.persist(&runs);
            }
            expired
        };

        for run in &expired {
            if let Err(e) = delete_session(self.inner.gateway.as_ref(), &run.child_session_key).await {
                tracing::warn!(
                    "Failed to delete archived subagent session {}: {}",
                    run.child_session_key,
                    e
                );
            }
        }
        if !expired.is_empty() {
            tracing::info!("Swept {} archived subagent runs", expired.len());
        }
        expired.len()
    }

    /// 登记表为空时清空清扫任务槽位并返回 true
    ///
    /// 持有记录锁期间检查并清槽，与 register 的插入互斥，不会漏启清扫任务。
    async fn release_sweeper_if_idle(&self) -> bool {
        let runs = self.inner.runs.lock().await;
        if !runs.is_empty() {
            return false;
        }
        lock_std(&self.inner.sweeper).take();
        true
    }
}
