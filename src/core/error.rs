//! 错误类型
//!
//! 稳态路径上的失败（等待超时、通知失败、落盘失败）都在各组件内部降级处理，
//! 只有登记时的参数校验会把 SubagentError 返回给调用方。

use thiserror::Error;

/// 网关 RPC 错误（传输、超时、远端返回失败）
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway not connected")]
    NotConnected,

    #[error("Gateway request timed out after {0}ms")]
    Timeout(u64),

    #[error("Gateway transport error: {0}")]
    Transport(String),

    #[error("Gateway method {method} failed: {message}")]
    Remote { method: String, message: String },

    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),

    #[error("Failed to encode gateway params: {0}")]
    Encode(#[from] serde_json::Error),
}

/// 运行登记表落盘错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Registry IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Registry serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 子智能体编排错误
#[derive(Error, Debug)]
pub enum SubagentError {
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Run already registered: {0}")]
    DuplicateRun(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
