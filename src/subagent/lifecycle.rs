//! 完成检测与结果分派
//!
//! 两条互相竞争的检测路径：
//! - 进程内监听：订阅事件总线的 lifecycle 流
//! - 跨进程等待：对网关发起阻塞的 `agent.wait`
//!
//! 终态只写一次，真正写入的那一方继续分派：拦截器 → 重试 → 通知/清理。

use std::sync::{Arc, Weak};

use tokio::sync::broadcast;

use super::registry::{lock_std, RegistryInner, SubagentRegistry};
use super::run::{now_ms, RunOutcome};
use crate::gateway::{wait_for_run, AgentEvent, AgentWaitResponse, GatewayRpc, LifecyclePhase};

impl SubagentRegistry {
    /// 确保事件监听任务在运行（每个实例至多一个）
    pub(crate) fn ensure_listener(&self) {
        let mut slot = lock_std(&self.inner.listener);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        // 先订阅再 spawn，避免漏掉紧随登记之后的事件
        let mut rx = self.inner.events.subscribe();
        let weak = self.downgrade();
        *slot = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(registry) = SubagentRegistry::upgrade(&weak) else {
                            break;
                        };
                        registry.handle_lifecycle_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Subagent lifecycle listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// 处理一条 agent 事件；非 lifecycle 流或未知 runId 直接忽略
    pub async fn handle_lifecycle_event(&self, event: AgentEvent) {
        let Some(data) = event.lifecycle_data() else {
            return;
        };
        match data.phase {
            LifecyclePhase::Start => {
                let Some(started_at) = data.started_at else {
                    return;
                };
                let mut runs = self.inner.runs.lock().await;
                if let Some(run) = runs.get_mut(&event.run_id) {
                    run.started_at = Some(started_at);
                    self.persist(&runs);
                }
            }
            LifecyclePhase::End | LifecyclePhase::Error => {
                let outcome = if data.phase == LifecyclePhase::End {
                    RunOutcome::Ok
                } else {
                    RunOutcome::error(data.error)
                };
                let ended_at = data.ended_at.unwrap_or_else(now_ms);
                if self.record_terminal(&event.run_id, None, ended_at, outcome).await {
                    self.spawn_resolution(event.run_id);
                }
            }
            LifecyclePhase::Other => {}
        }
    }

    /// 写入终态；已有终态或记录不存在时返回 false
    pub(crate) async fn record_terminal(
        &self,
        run_id: &str,
        started_at: Option<i64>,
        ended_at: i64,
        outcome: RunOutcome,
    ) -> bool {
        let mut runs = self.inner.runs.lock().await;
        let Some(run) = runs.get_mut(run_id) else {
            return false;
        };
        if run.outcome.is_some() {
            return false;
        }
        if let Some(started_at) = started_at {
            run.started_at = Some(started_at);
        }
        run.ended_at = Some(ended_at);
        run.outcome = Some(outcome);
        tracing::debug!("Subagent run {} reached terminal state", run_id);
        self.persist(&runs);
        true
    }

    /// 发起跨进程完成等待；超时或传输失败不重试，交给监听或下次恢复
    pub(crate) fn spawn_completion_wait(&self, run_id: String, timeout_ms: u64) {
        let gateway = Arc::clone(&self.inner.gateway);
        let weak = self.downgrade();
        tokio::spawn(wait_for_completion(gateway, weak, run_id, timeout_ms));
    }

    pub(crate) async fn apply_wait_response(&self, run_id: &str, response: AgentWaitResponse) {
        if !response.is_terminal() {
            tracing::debug!(
                "agent.wait for subagent run {} returned without terminal state: {}",
                run_id,
                response.status
            );
            return;
        }
        let outcome = if response.status == "ok" {
            RunOutcome::Ok
        } else {
            RunOutcome::error(response.error)
        };
        let ended_at = response.ended_at.unwrap_or_else(now_ms);
        if self.record_terminal(run_id, response.started_at, ended_at, outcome).await {
            self.resolve_outcome(run_id).await;
        }
    }

    fn spawn_resolution(&self, run_id: String) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.resolve_outcome(&run_id).await;
        });
    }

    /// 终态分派：拦截器接管 → 重试 → 通知/清理
    pub(crate) async fn resolve_outcome(&self, run_id: &str) {
        let Some(run) = self.get(run_id).await else {
            return;
        };

        if let Some(interceptor) = self.interceptor() {
            if interceptor(run_id, &run) {
                tracing::debug!("Subagent run {} claimed by completion interceptor", run_id);
                return;
            }
        }

        if run.should_retry() {
            if self.begin_retry(run_id).await {
                self.retry_run(run).await;
            }
            return;
        }

        self.run_cleanup_flow(run_id).await;
    }

    /// 认领重试；每条记录只能成功一次，且与清理认领互斥
    pub(crate) async fn begin_retry(&self, run_id: &str) -> bool {
        let mut runs = self.inner.runs.lock().await;
        let Some(run) = runs.get_mut(run_id) else {
            return false;
        };
        if run.retry_handled || run.cleanup_handled {
            return false;
        }
        run.retry_handled = true;
        self.persist(&runs);
        true
    }
}

async fn wait_for_completion(
    gateway: Arc<dyn GatewayRpc>,
    registry: Weak<RegistryInner>,
    run_id: String,
    timeout_ms: u64,
) {
    let response = match wait_for_run(gateway.as_ref(), &run_id, timeout_ms).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("agent.wait for subagent run {} failed: {}", run_id, e);
            return;
        }
    };
    if let Some(registry) = SubagentRegistry::upgrade(&registry) {
        registry.apply_wait_response(&run_id, response).await;
    }
}
