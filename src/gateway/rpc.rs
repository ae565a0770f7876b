//! 网关 RPC 抽象与常用方法封装
//!
//! 编排器只依赖 `GatewayRpc` trait；WebSocket 实现见 `client.rs`，测试里用内存假实现。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::message::DeliveryContext;
use crate::core::GatewayError;

/// 普通 RPC 调用的默认超时（实现未覆盖 `request_timeout` 时使用）
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// agent.wait 的传输层超时在等待时长之上额外留出的余量
pub const WAIT_TRANSPORT_GRACE_MS: u64 = 10_000;

/// 子智能体运行所在的执行通道
pub const AGENT_LANE_SUBAGENT: &str = "subagent";

/// 网关 RPC 客户端
#[async_trait]
pub trait GatewayRpc: Send + Sync {
    /// 调用远端方法，返回 payload
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, GatewayError>;

    /// 除 agent.wait 外所有方法的超时
    fn request_timeout(&self) -> Duration {
        DEFAULT_RPC_TIMEOUT
    }
}

/// `agent` 方法参数（派生子会话）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnAgentParams {
    pub message: String,
    pub session_key: String,
    pub idempotency_key: String,
    /// 子会话的回复不直接投递给终端用户
    pub deliver: bool,
    pub lane: String,
    pub extra_system_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// 运行超时（秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl SpawnAgentParams {
    pub fn new(
        message: impl Into<String>,
        session_key: impl Into<String>,
        idempotency_key: impl Into<String>,
        extra_system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            session_key: session_key.into(),
            idempotency_key: idempotency_key.into(),
            deliver: false,
            lane: AGENT_LANE_SUBAGENT.to_string(),
            extra_system_prompt: extra_system_prompt.into(),
            channel: None,
            to: None,
            account_id: None,
            thread_id: None,
            label: None,
            model: None,
            timeout: None,
        }
    }

    pub fn with_origin(mut self, origin: Option<&DeliveryContext>) -> Self {
        if let Some(origin) = origin {
            self.channel = origin.channel.clone();
            self.to = origin.to.clone();
            self.account_id = origin.account_id.clone();
            self.thread_id = origin.thread_id.clone();
        }
        self
    }
}

/// `agent.wait` 的返回值；status 为 ok / error 以外（如 timeout）表示尚无终态
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentWaitResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentWaitResponse {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "error")
    }
}

/// 派生子会话运行；远端未返回 runId 时沿用幂等键
pub async fn spawn_agent(gateway: &dyn GatewayRpc, params: &SpawnAgentParams) -> Result<String, GatewayError> {
    let payload = gateway
        .call("agent", serde_json::to_value(params)?, gateway.request_timeout())
        .await?;
    let run_id = payload
        .get("runId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| params.idempotency_key.clone());
    Ok(run_id)
}

/// 阻塞等待运行结束（最多 timeout_ms）
pub async fn wait_for_run(
    gateway: &dyn GatewayRpc,
    run_id: &str,
    timeout_ms: u64,
) -> Result<AgentWaitResponse, GatewayError> {
    let payload = gateway
        .call(
            "agent.wait",
            json!({ "runId": run_id, "timeoutMs": timeout_ms }),
            Duration::from_millis(timeout_ms.saturating_add(WAIT_TRANSPORT_GRACE_MS)),
        )
        .await?;
    serde_json::from_value(payload).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
}

/// 删除子会话（含 transcript）
pub async fn delete_session(gateway: &dyn GatewayRpc, key: &str) -> Result<(), GatewayError> {
    gateway
        .call(
            "sessions.delete",
            json!({ "key": key, "deleteTranscript": true }),
            gateway.request_timeout(),
        )
        .await?;
    Ok(())
}

/// 读取会话最近的消息
pub async fn chat_history(gateway: &dyn GatewayRpc, session_key: &str, limit: usize) -> Result<Vec<Value>, GatewayError> {
    let payload = gateway
        .call(
            "chat.history",
            json!({ "sessionKey": session_key, "limit": limit }),
            gateway.request_timeout(),
        )
        .await?;
    match payload.get("messages") {
        Some(Value::Array(messages)) => Ok(messages.clone()),
        Some(_) => Err(GatewayError::InvalidResponse("chat.history messages is not an array".into())),
        None => Ok(Vec::new()),
    }
}

/// 把一条消息注入会话 transcript
pub async fn chat_inject(
    gateway: &dyn GatewayRpc,
    session_key: &str,
    message: &str,
    label: Option<&str>,
) -> Result<(), GatewayError> {
    let mut params = json!({ "sessionKey": session_key, "message": message });
    if let Some(label) = label {
        params["label"] = Value::String(label.to_string());
    }
    gateway.call("chat.inject", params, gateway.request_timeout()).await?;
    Ok(())
}

/// 通过渠道向投递上下文发消息
pub async fn send_message(
    gateway: &dyn GatewayRpc,
    origin: &DeliveryContext,
    message: &str,
) -> Result<(), GatewayError> {
    let mut params = serde_json::to_value(origin)?;
    params["message"] = Value::String(message.to_string());
    params["idempotencyKey"] = Value::String(uuid::Uuid::new_v4().to_string());
    gateway.call("send", params, gateway.request_timeout()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// 记录调用并按方法返回固定 payload
    struct ScriptedGateway {
        calls: Mutex<Vec<(String, Value, Duration)>>,
        payload: Value,
        timeout: Option<Duration>,
    }

    #[async_trait]
    impl GatewayRpc for ScriptedGateway {
        async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, GatewayError> {
            self.calls.lock().unwrap().push((method.to_string(), params, timeout));
            Ok(self.payload.clone())
        }

        fn request_timeout(&self) -> Duration {
            self.timeout.unwrap_or(DEFAULT_RPC_TIMEOUT)
        }
    }

    fn gateway(payload: Value) -> ScriptedGateway {
        ScriptedGateway {
            calls: Mutex::new(Vec::new()),
            payload,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_spawn_agent_params_and_run_id() {
        let gw = gateway(json!({ "runId": "run-remote" }));
        let origin = DeliveryContext {
            channel: Some("discord".into()),
            to: Some("channel:1".into()),
            ..Default::default()
        };
        let params = SpawnAgentParams::new("do it", "agent:main:subagent:x", "idem-1", "prompt")
            .with_origin(Some(&origin));
        let run_id = spawn_agent(&gw, &params).await.unwrap();
        assert_eq!(run_id, "run-remote");

        let calls = gw.calls.lock().unwrap();
        let (method, sent, _) = &calls[0];
        assert_eq!(method, "agent");
        assert_eq!(sent["sessionKey"], "agent:main:subagent:x");
        assert_eq!(sent["idempotencyKey"], "idem-1");
        assert_eq!(sent["deliver"], false);
        assert_eq!(sent["lane"], "subagent");
        assert_eq!(sent["channel"], "discord");
        assert!(sent.get("label").is_none());
    }

    #[tokio::test]
    async fn test_spawn_agent_falls_back_to_idempotency_key() {
        let gw = gateway(json!({}));
        let params = SpawnAgentParams::new("t", "k", "idem-2", "");
        assert_eq!(spawn_agent(&gw, &params).await.unwrap(), "idem-2");
    }

    #[tokio::test]
    async fn test_wait_for_run_adds_transport_grace() {
        let gw = gateway(json!({ "status": "timeout" }));
        let response = wait_for_run(&gw, "r1", 5_000).await.unwrap();
        assert!(!response.is_terminal());

        let calls = gw.calls.lock().unwrap();
        assert_eq!(calls[0].1, json!({ "runId": "r1", "timeoutMs": 5_000 }));
        assert_eq!(calls[0].2, Duration::from_millis(15_000));
    }

    #[tokio::test]
    async fn test_delete_session_requests_transcript_removal() {
        let gw = gateway(json!({ "ok": true }));
        delete_session(&gw, "agent:main:subagent:y").await.unwrap();
        let calls = gw.calls.lock().unwrap();
        assert_eq!(calls[0].0, "sessions.delete");
        assert_eq!(calls[0].1["deleteTranscript"], true);
    }

    #[tokio::test]
    async fn test_helpers_use_transport_request_timeout() {
        let mut gw = gateway(json!({ "messages": [] }));
        gw.timeout = Some(Duration::from_secs(3));
        let origin = DeliveryContext {
            channel: Some("slack".into()),
            to: Some("C1".into()),
            ..Default::default()
        };

        spawn_agent(&gw, &SpawnAgentParams::new("t", "k", "idem", "")).await.unwrap();
        delete_session(&gw, "k").await.unwrap();
        chat_history(&gw, "k", 5).await.unwrap();
        chat_inject(&gw, "k", "hi", None).await.unwrap();
        send_message(&gw, &origin, "hi").await.unwrap();
        wait_for_run(&gw, "r", 1_000).await.unwrap();

        let calls = gw.calls.lock().unwrap();
        assert_eq!(calls.len(), 6);
        for (method, _, timeout) in calls.iter().filter(|(m, _, _)| m != "agent.wait") {
            assert_eq!(*timeout, Duration::from_secs(3), "{} used the wrong timeout", method);
        }
        assert_eq!(calls[5].2, Duration::from_millis(11_000));
    }

    #[tokio::test]
    async fn test_chat_history_rejects_malformed_messages() {
        let gw = gateway(json!({ "messages": "nope" }));
        assert!(chat_history(&gw, "s", 10).await.is_err());

        let gw = gateway(json!({}));
        assert!(chat_history(&gw, "s", 10).await.unwrap().is_empty());
    }
}
