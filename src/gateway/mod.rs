//! 网关接入层
//!
//! 编排器与网关之间的全部交互：
//! - **RPC**：`agent`（派生）、`agent.wait`（阻塞等待）、`sessions.delete`、
//!   `chat.history` / `chat.inject` / `send`（通知）
//! - **事件**：网关推送的 agent 生命周期事件经进程内事件总线分发
//! - **协议**：JSON 文本帧（req / res / event）

mod client;
mod events;
mod message;
mod rpc;

pub use client::WsGatewayClient;
pub use events::{AgentEvent, AgentEventBus, LifecycleData, LifecyclePhase, LIFECYCLE_STREAM};
pub use message::{DeliveryContext, FrameError, RequestFrame, ServerFrame};
pub use rpc::{
    chat_history, chat_inject, delete_session, send_message, spawn_agent, wait_for_run,
    AgentWaitResponse, GatewayRpc, SpawnAgentParams, AGENT_LANE_SUBAGENT, DEFAULT_RPC_TIMEOUT,
    WAIT_TRANSPORT_GRACE_MS,
};
