//! WebSocket 网关客户端
//!
//! 单条长连接上复用所有 RPC：请求带 uuid，响应按 id 匹配到等待中的 oneshot；
//! `agent` 事件转发到进程内事件总线，供运行登记表的生命周期监听使用。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::events::{AgentEvent, AgentEventBus};
use super::message::{RequestFrame, ServerFrame};
use super::rpc::GatewayRpc;
use crate::config::GatewaySection;
use crate::core::GatewayError;

type PendingReply = oneshot::Sender<Result<Value, GatewayError>>;

/// 等待响应的请求：id -> (method, 回调)
type PendingMap = Arc<Mutex<HashMap<String, (String, PendingReply)>>>;

pub struct WsGatewayClient {
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
    /// 主动关闭
    shutdown: CancellationToken,
    /// 连接已断开（主动或被动）
    disconnected: CancellationToken,
}

impl WsGatewayClient {
    /// 建立连接并完成 `connect` 握手
    pub async fn connect(config: &GatewaySection, events: AgentEventBus) -> Result<Arc<Self>, GatewayError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(config.url.as_str())
            .await
            .map_err(|e| GatewayError::Transport(format!("connect {} failed: {}", config.url, e)))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        let disconnected = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_connected = Arc::clone(&connected);
        let reader_shutdown = shutdown.clone();
        let reader_disconnected = disconnected.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    msg = ws_rx.next() => msg,
                };
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(&text, &reader_pending, &events).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!("Gateway receive error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            let mut pending = reader_pending.lock().await;
            for (_, (_, reply)) in pending.drain() {
                let _ = reply.send(Err(GatewayError::NotConnected));
            }
            drop(pending);
            reader_disconnected.cancel();
            tracing::info!("Gateway connection closed");
        });

        let client = Arc::new(Self {
            outbound: tx,
            pending,
            connected,
            request_timeout: config.request_timeout(),
            shutdown,
            disconnected,
        });

        let mut hello = json!({
            "client": { "id": "bee-subagents", "version": env!("CARGO_PKG_VERSION") },
        });
        if let Some(token) = config.token.as_deref() {
            hello["auth"] = json!({ "token": token });
        }
        client.call("connect", hello, client.request_timeout).await?;

        tracing::info!("Connected to gateway at {}", config.url);
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// 连接断开时返回
    pub async fn closed(&self) {
        self.disconnected.cancelled().await;
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn handle_frame(text: &str, pending: &PendingMap, events: &AgentEventBus) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!("Ignoring unparseable gateway frame: {}", e);
            return;
        }
    };

    match frame {
        ServerFrame::Res { id, ok, payload, error } => {
            let Some((method, reply)) = pending.lock().await.remove(&id) else {
                return;
            };
            let result = if ok {
                Ok(payload.unwrap_or(Value::Null))
            } else {
                Err(GatewayError::Remote {
                    method,
                    message: error.map(|e| e.describe()).unwrap_or_else(|| "unknown error".into()),
                })
            };
            let _ = reply.send(result);
        }
        ServerFrame::Event { event, payload } if event == "agent" => {
            match payload.map(serde_json::from_value::<AgentEvent>) {
                Some(Ok(agent_event)) => {
                    events.emit(agent_event);
                }
                Some(Err(e)) => tracing::debug!("Malformed agent event: {}", e),
                None => {}
            }
        }
        _ => {}
    }
}

#[async_trait]
impl GatewayRpc for WsGatewayClient {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&RequestFrame::new(&id, method, &params))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(id.clone(), (method.to_string(), reply_tx));

        if self.outbound.send(frame).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(GatewayError::NotConnected);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::NotConnected),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_frame_resolves_pending_call() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), ("agent.wait".into(), tx));

        handle_frame(
            r#"{"type":"res","id":"req-1","ok":true,"payload":{"status":"ok"}}"#,
            &pending,
            &AgentEventBus::default(),
        )
        .await;

        let payload = rx.await.unwrap().unwrap();
        assert_eq!(payload["status"], "ok");
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_error_frame_carries_method() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-2".into(), ("sessions.delete".into(), tx));

        handle_frame(
            r#"{"type":"res","id":"req-2","ok":false,"error":{"message":"not found"}}"#,
            &pending,
            &AgentEventBus::default(),
        )
        .await;

        match rx.await.unwrap() {
            Err(GatewayError::Remote { method, message }) => {
                assert_eq!(method, "sessions.delete");
                assert_eq!(message, "not found");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_events_forwarded_to_bus() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let bus = AgentEventBus::default();
        let mut rx = bus.subscribe();

        handle_frame(
            r#"{"type":"event","event":"agent","payload":{"runId":"r1","stream":"lifecycle","data":{"phase":"end"}}}"#,
            &pending,
            &bus,
        )
        .await;
        handle_frame(r#"{"type":"event","event":"tick","payload":{}}"#, &pending, &bus).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id, "r1");
        assert!(rx.try_recv().is_err());
    }
}
