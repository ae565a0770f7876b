//! 子智能体运行编排
//!
//! 跟踪每一次派生出去的子会话运行直到结束，失败时带上下文重试，
//! 把结果通知回请求方，最后回收记录与远端会话；进程重启后从磁盘接续。
//!
//! - **run**：运行记录与登记参数
//! - **spawn**：派生子智能体并登记
//! - **store**：登记表落盘（JSON 文件 / 内存）
//! - **registry**：登记表本体与查询
//! - **lifecycle**：进程内监听 + 跨进程等待，终态一次写入后分派
//! - **cleanup**：通知与两阶段清理
//! - **retry**：transcript 摘要与重试派生
//! - **sweeper**：归档记录的周期清扫
//! - **recovery**：启动时恢复

mod cleanup;
mod lifecycle;
mod recovery;
mod registry;
mod retry;
mod run;
mod session_key;
mod spawn;
mod store;
mod sweeper;
mod telemetry;

pub use cleanup::{format_announcement, AnnounceRequest, Announcer, GatewayAnnouncer};
pub use registry::{
    CompletionInterceptor, RegistryDeps, RegistrySettings, SubagentRegistry, MAX_WAIT_MS,
};
pub use retry::{
    build_subagent_system_prompt, format_retry_task, summarize_messages, GatewayTranscriptSummarizer,
    RetryContext, TranscriptSummarizer, TranscriptSummary,
};
pub use run::{retry_label, CleanupMode, RegisterRunParams, RunOutcome, SubagentRun};
pub use session_key::{new_subagent_session_key, resolve_agent_id, DEFAULT_AGENT_ID};
pub use spawn::{SpawnOutcome, SpawnSubagentRequest, SPAWN_ACCEPTED_NOTE};
pub use store::{JsonFileRunStore, MemoryRunStore, RunMap, RunStore};
pub use telemetry::{RunTelemetry, TracingTelemetry};
