//! 网关消息协议定义
//!
//! 请求 / 响应 / 事件三种帧，均为 JSON 文本帧：
//! - `{"type":"req","id","method","params"}`
//! - `{"type":"res","id","ok","payload","error"}`
//! - `{"type":"event","event","payload"}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 客户端发出的请求帧
#[derive(Debug, Clone, Serialize)]
pub struct RequestFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: &'a str,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> RequestFrame<'a> {
    pub fn new(id: &'a str, method: &'a str, params: &'a Value) -> Self {
        Self {
            kind: "req",
            id,
            method,
            params,
        }
    }
}

/// 网关返回的错误体
#[derive(Debug, Clone, Deserialize)]
pub struct FrameError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl FrameError {
    pub fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

/// 服务端发来的帧
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Res {
        id: String,
        ok: bool,
        #[serde(default)]
        payload: Option<Value>,
        #[serde(default)]
        error: Option<FrameError>,
    },
    Event {
        event: String,
        #[serde(default)]
        payload: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

/// 投递上下文：把通知送回请求方所需的渠道路由信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl DeliveryContext {
    /// 去除首尾空白，丢弃空字段；全部为空时返回 None
    pub fn normalize(context: Option<DeliveryContext>) -> Option<DeliveryContext> {
        let context = context?;
        let clean = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let normalized = DeliveryContext {
            channel: clean(context.channel).map(|c| c.to_lowercase()),
            to: clean(context.to),
            account_id: clean(context.account_id),
            thread_id: clean(context.thread_id),
        };
        if normalized == DeliveryContext::default() {
            None
        } else {
            Some(normalized)
        }
    }

    /// 是否足以直接发消息（渠道 + 目标都已知）
    pub fn is_routable(&self) -> bool {
        self.channel.is_some() && self.to.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_frame() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{"type":"res","id":"1","ok":false,"error":{"code":"NOT_FOUND","message":"no such run"}}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::Res { id, ok, error, .. } => {
                assert_eq!(id, "1");
                assert!(!ok);
                assert_eq!(error.unwrap().describe(), "NOT_FOUND: no such run");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_frame_type() {
        let frame: ServerFrame = serde_json::from_str(r#"{"type":"hello-ok","protocol":3}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Unknown));
    }

    #[test]
    fn test_request_frame_shape() {
        let params = serde_json::json!({"runId": "r1"});
        let frame = RequestFrame::new("abc", "agent.wait", &params);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "req");
        assert_eq!(value["method"], "agent.wait");
        assert_eq!(value["params"]["runId"], "r1");
    }

    #[test]
    fn test_normalize_delivery_context() {
        let ctx = DeliveryContext {
            channel: Some(" Telegram ".into()),
            to: Some("12345".into()),
            account_id: Some("  ".into()),
            thread_id: None,
        };
        let normalized = DeliveryContext::normalize(Some(ctx)).unwrap();
        assert_eq!(normalized.channel.as_deref(), Some("telegram"));
        assert_eq!(normalized.account_id, None);
        assert!(normalized.is_routable());

        let empty = DeliveryContext {
            channel: Some("".into()),
            ..Default::default()
        };
        assert_eq!(DeliveryContext::normalize(Some(empty)), None);
        assert_eq!(DeliveryContext::normalize(None), None);
    }
}
