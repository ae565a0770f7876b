//! 派生子智能体
//!
//! 检查请求方的并发子运行上限与目标 agent 授权，生成子会话 key，
//! 调用网关 `agent` 启动运行，成功后登记到运行登记表。

use serde::Serialize;

use super::registry::SubagentRegistry;
use super::retry::build_subagent_system_prompt;
use super::run::{CleanupMode, RegisterRunParams};
use super::session_key::{new_subagent_session_key, resolve_agent_id};
use crate::gateway::{spawn_agent, DeliveryContext, SpawnAgentParams};

/// 派生成功时返回给调用方的提示
pub const SPAWN_ACCEPTED_NOTE: &str =
    "auto-announces on completion, do not poll/sleep. The response will be sent back as an user message.";

/// 派生请求
#[derive(Debug, Clone, Default)]
pub struct SpawnSubagentRequest {
    pub task: String,
    pub requester_session_key: String,
    /// 展示用 key，未设置时沿用 requester_session_key
    pub requester_display_key: Option<String>,
    pub requester_origin: Option<DeliveryContext>,
    pub label: Option<String>,
    /// 目标 agent；未设置时与请求方同一 agent
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub run_timeout_seconds: Option<u64>,
    pub cleanup: CleanupMode,
    pub max_retries: Option<u32>,
}

impl SpawnSubagentRequest {
    pub fn new(requester_session_key: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            requester_session_key: requester_session_key.into(),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupMode) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_origin(mut self, origin: DeliveryContext) -> Self {
        self.requester_origin = Some(origin);
        self
    }
}

/// 派生结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SpawnOutcome {
    #[serde(rename_all = "camelCase")]
    Accepted {
        run_id: String,
        child_session_key: String,
        note: String,
    },
    Forbidden {
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        child_session_key: Option<String>,
    },
}

impl SpawnOutcome {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            SpawnOutcome::Accepted { run_id, .. } => Some(run_id),
            _ => None,
        }
    }

    fn error(error: impl Into<String>, child_session_key: Option<String>) -> Self {
        SpawnOutcome::Error {
            error: error.into(),
            child_session_key,
        }
    }
}

fn child_task_message(task: &str) -> String {
    format!(
        "[Subagent Context] You are running as a subagent. Results auto-announce to your requester; \
         do not busy-poll for status.\n\n[Subagent Task]: {}",
        task
    )
}

impl SubagentRegistry {
    /// 派生一个子智能体运行并登记
    ///
    /// 超出并发上限或目标 agent 未授权时返回 Forbidden，网关或登记失败时返回 Error。
    pub async fn spawn_subagent(&self, request: SpawnSubagentRequest) -> SpawnOutcome {
        let task = request.task.trim();
        let requester = request.requester_session_key.trim();
        if task.is_empty() {
            return SpawnOutcome::error("task must not be empty", None);
        }
        if requester.is_empty() {
            return SpawnOutcome::error("requester session key must not be empty", None);
        }

        let settings = self.settings();
        let active = self.count_active_for_session(requester).await;
        if active >= settings.max_children_per_agent {
            return SpawnOutcome::Forbidden {
                error: format!(
                    "reached max active children for this session ({}/{})",
                    active, settings.max_children_per_agent
                ),
            };
        }

        let requester_agent = resolve_agent_id(requester);
        let target_agent = request
            .agent_id
            .as_deref()
            .map(|id| id.trim().to_lowercase())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| requester_agent.clone());
        if target_agent != requester_agent {
            let allowed = settings
                .allow_agents
                .get(&requester_agent)
                .map(Vec::as_slice)
                .unwrap_or_default();
            if !allowed.iter().any(|id| id == "*" || *id == target_agent) {
                let allowed_text = if allowed.is_empty() {
                    "none".to_string()
                } else {
                    allowed.join(", ")
                };
                return SpawnOutcome::Forbidden {
                    error: format!("agent {} is not allowed (allowed: {})", target_agent, allowed_text),
                };
            }
        }

        let label = request
            .label
            .as_deref()
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string);
        let origin = DeliveryContext::normalize(request.requester_origin);
        let child_session_key = new_subagent_session_key(&target_agent);
        let system_prompt = build_subagent_system_prompt(
            requester,
            origin.as_ref(),
            &child_session_key,
            label.as_deref(),
            task,
        );

        let mut spawn = SpawnAgentParams::new(
            child_task_message(task),
            child_session_key.as_str(),
            uuid::Uuid::new_v4().to_string(),
            system_prompt,
        )
        .with_origin(origin.as_ref());
        spawn.label = label.clone();
        spawn.model = request.model.clone();
        spawn.timeout = request.run_timeout_seconds;
        let run_id = match spawn_agent(self.inner.gateway.as_ref(), &spawn).await {
            Ok(run_id) => run_id,
            Err(e) => {
                tracing::warn!("Failed to spawn subagent for {}: {}", requester, e);
                return SpawnOutcome::error(e.to_string(), Some(child_session_key));
            }
        };

        let mut params = RegisterRunParams::new(run_id.as_str(), child_session_key.as_str(), requester, task)
            .with_cleanup(request.cleanup);
        if let Some(display_key) = request.requester_display_key {
            params = params.with_display_key(display_key);
        }
        params.requester_origin = origin;
        params.label = label;
        params.model = request.model;
        params.run_timeout_seconds = request.run_timeout_seconds;
        params.max_retries = request.max_retries;

        match self.register(params).await {
            Ok(run) => {
                tracing::info!(
                    "Spawned subagent run {} on {} for {}",
                    run.run_id,
                    run.child_session_key,
                    run.requester_session_key
                );
                SpawnOutcome::Accepted {
                    run_id: run.run_id,
                    child_session_key: run.child_session_key,
                    note: SPAWN_ACCEPTED_NOTE.to_string(),
                }
            }
            Err(e) => SpawnOutcome::error(e.to_string(), Some(child_session_key)),
        }
    }
}
