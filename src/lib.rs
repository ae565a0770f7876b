//! Bee Subagents - 子智能体运行编排
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、尽力而为的副作用、优雅关闭
//! - **gateway**: 网关接入（WebSocket RPC 客户端、agent 事件总线）
//! - **observability**: tracing 初始化
//! - **subagent**: 运行登记表、完成检测、重试、通知清理、归档清扫、重启恢复

pub mod config;
pub mod core;
pub mod gateway;
pub mod observability;
pub mod subagent;

pub use subagent::{RegisterRunParams, RegistryDeps, RegistrySettings, SubagentRegistry, SubagentRun};
