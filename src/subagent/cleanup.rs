//! 通知与清理
//!
//! 两阶段：`begin_cleanup` 在锁内认领（cleanupHandled），通知结束后 `finalize_cleanup`
//! 按模式删除记录、标记完成或释放认领。

use std::sync::Arc;

use async_trait::async_trait;

use super::registry::SubagentRegistry;
use super::retry::summarize_messages;
use super::run::{now_ms, CleanupMode, RunOutcome, SubagentRun};
use crate::core::spawn_best_effort;
use crate::gateway::{chat_history, chat_inject, delete_session, send_message, DeliveryContext, GatewayRpc};

/// 读取子会话最终回复时拉取的历史条数
const ANNOUNCE_HISTORY_LIMIT: usize = 50;

/// 交给通知服务的内容
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceRequest {
    pub child_session_key: String,
    pub child_run_id: String,
    pub requester_session_key: String,
    pub requester_display_key: String,
    pub requester_origin: Option<DeliveryContext>,
    pub task: String,
    pub label: Option<String>,
    pub outcome: Option<RunOutcome>,
    pub cleanup: CleanupMode,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub timeout_ms: u64,
    /// 记录已有终态，通知方不必再等待远端完成
    pub wait_for_completion: bool,
}

impl AnnounceRequest {
    pub fn from_run(run: &SubagentRun, timeout_ms: u64) -> Self {
        Self {
            child_session_key: run.child_session_key.clone(),
            child_run_id: run.run_id.clone(),
            requester_session_key: run.requester_session_key.clone(),
            requester_display_key: run.requester_display_key.clone(),
            requester_origin: run.requester_origin.clone(),
            task: run.original_task.clone(),
            label: run.label.clone(),
            outcome: run.outcome.clone(),
            cleanup: run.cleanup,
            started_at: run.started_at,
            ended_at: run.ended_at,
            timeout_ms,
            wait_for_completion: false,
        }
    }

    pub fn elapsed_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).max(0)),
            _ => None,
        }
    }
}

/// 通知服务；返回是否至少送达一处
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, request: AnnounceRequest) -> bool;
}

impl SubagentRegistry {
    /// 认领通知/清理；已完成或已被认领时返回 false
    pub async fn begin_cleanup(&self, run_id: &str) -> bool {
        let mut runs = self.inner.runs.lock().await;
        let Some(run) = runs.get_mut(run_id) else {
            return false;
        };
        if run.cleanup_completed_at.is_some() || run.cleanup_handled {
            return false;
        }
        run.cleanup_handled = true;
        self.persist(&runs);
        true
    }

    /// 通知结束后的收尾
    ///
    /// - delete：无论是否送达都删除记录
    /// - keep + 已送达：记下完成时间，等待清扫
    /// - keep + 未送达：释放认领，留给下次唤醒（如重启恢复）再通知
    pub async fn finalize_cleanup(&self, run_id: &str, cleanup: CleanupMode, did_announce: bool) {
        if cleanup == CleanupMode::Delete {
            self.remove(run_id).await;
            return;
        }
        let mut runs = self.inner.runs.lock().await;
        let Some(run) = runs.get_mut(run_id) else {
            return;
        };
        if did_announce {
            run.cleanup_completed_at = Some(now_ms());
        } else {
            run.cleanup_handled = false;
        }
        self.persist(&runs);
    }

    pub(crate) async fn run_cleanup_flow(&self, run_id: &str) {
        if !self.begin_cleanup(run_id).await {
            return;
        }
        let Some(run) = self.get(run_id).await else {
            return;
        };

        if let Some(telemetry) = self.inner.telemetry.clone() {
            let snapshot = run.clone();
            spawn_best_effort("run telemetry", async move { telemetry.record_completion(&snapshot).await });
        }

        let request = AnnounceRequest::from_run(&run, self.wait_timeout_ms(&run));
        let did_announce = self.inner.announcer.announce(request).await;
        if !did_announce {
            tracing::warn!("Announce for subagent run {} was not delivered", run_id);
        }
        self.finalize_cleanup(run_id, run.cleanup, did_announce).await;
    }
}

/// 经网关通知请求方：注入请求方会话 transcript，渠道路由已知时再直接发送
pub struct GatewayAnnouncer {
    gateway: Arc<dyn GatewayRpc>,
}

impl GatewayAnnouncer {
    pub fn new(gateway: Arc<dyn GatewayRpc>) -> Self {
        Self { gateway }
    }

    async fn latest_reply(&self, session_key: &str) -> Option<String> {
        match chat_history(self.gateway.as_ref(), session_key, ANNOUNCE_HISTORY_LIMIT).await {
            Ok(messages) => summarize_messages(&messages).last_assistant_text,
            Err(e) => {
                tracing::debug!("Failed to read reply of {}: {}", session_key, e);
                None
            }
        }
    }
}

#[async_trait]
impl Announcer for GatewayAnnouncer {
    async fn announce(&self, request: AnnounceRequest) -> bool {
        let reply = self.latest_reply(&request.child_session_key).await;
        let message = format_announcement(&request, reply.as_deref());
        let inject_label = match request.label.as_deref() {
            Some(label) => format!("Subagent \"{}\" completed", label),
            None => "Subagent completed".to_string(),
        };

        let mut did_announce = false;
        match chat_inject(
            self.gateway.as_ref(),
            &request.requester_session_key,
            &message,
            Some(&inject_label),
        )
        .await
        {
            Ok(()) => did_announce = true,
            Err(e) => tracing::warn!("chat.inject into {} failed: {}", request.requester_session_key, e),
        }

        if let Some(origin) = request.requester_origin.as_ref().filter(|o| o.is_routable()) {
            match send_message(self.gateway.as_ref(), origin, &message).await {
                Ok(()) => did_announce = true,
                Err(e) => tracing::warn!("Announce send to {:?} failed: {}", origin.channel, e),
            }
        }

        if request.cleanup == CleanupMode::Delete {
            let gateway = Arc::clone(&self.gateway);
            let key = request.child_session_key.clone();
            spawn_best_effort("child session delete", async move {
                delete_session(gateway.as_ref(), &key).await?;
                Ok(())
            });
        }

        did_announce
    }
}

/// 通知正文
pub fn format_announcement(request: &AnnounceRequest, reply: Option<&str>) -> String {
    let name = match request.label.as_deref() {
        Some(label) => format!("Background task \"{}\"", label),
        None => "Background task".to_string(),
    };
    let headline = match &request.outcome {
        Some(RunOutcome::Ok) | None => format!("{} finished.", name),
        Some(RunOutcome::Error { error: Some(error) }) => format!("{} failed: {}", name, error),
        Some(RunOutcome::Error { error: None }) => format!("{} failed.", name),
    };

    let mut lines = vec![headline, String::new(), format!("Task: {}", request.task.trim())];
    if let Some(duration) = request.elapsed_ms().and_then(format_duration_short) {
        lines.push(format!("Duration: {}", duration));
    }
    match reply.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reply) => {
            lines.push(String::new());
            lines.push(reply.to_string());
        }
        None => lines.push("Result: (not available)".to_string()),
    }
    lines.join("\n")
}

/// 1h5m / 3m20s / 42s；非正值返回 None
fn format_duration_short(ms: i64) -> Option<String> {
    if ms <= 0 {
        return None;
    }
    let total_seconds = (ms + 500) / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    Some(if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    })
}
