//! 进程内 agent 事件总线
//!
//! 网关推送的 `agent` 事件与本进程产生的事件都走这里；生命周期事件
//! （stream = "lifecycle"）按 runId 分发给运行登记表。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub const LIFECYCLE_STREAM: &str = "lifecycle";

/// 单条 agent 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub run_id: String,
    pub stream: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

/// 生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
    #[serde(other)]
    Other,
}

/// lifecycle 事件的 data 部分
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleData {
    pub phase: LifecyclePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LifecycleData {
    pub fn new(phase: LifecyclePhase) -> Self {
        Self {
            phase,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    pub fn with_started_at(mut self, started_at: i64) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn with_ended_at(mut self, ended_at: i64) -> Self {
        self.ended_at = Some(ended_at);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

impl AgentEvent {
    pub fn lifecycle(run_id: impl Into<String>, data: LifecycleData) -> Self {
        Self {
            run_id: run_id.into(),
            stream: LIFECYCLE_STREAM.to_string(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            seq: None,
            ts: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    /// 非 lifecycle 流或 data 无法解析时返回 None
    pub fn lifecycle_data(&self) -> Option<LifecycleData> {
        if self.stream != LIFECYCLE_STREAM {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// 广播式事件总线（可克隆，所有克隆共享同一通道）
#[derive(Debug, Clone)]
pub struct AgentEventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl AgentEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// 发布事件，返回收到事件的订阅者数量
    pub fn emit(&self, event: AgentEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for AgentEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
