//! 运行完成遥测
//!
//! 通知前以尽力而为方式上报，失败不影响通知与清理。

use async_trait::async_trait;

use super::run::SubagentRun;

#[async_trait]
pub trait RunTelemetry: Send + Sync {
    async fn record_completion(&self, run: &SubagentRun) -> anyhow::Result<()>;
}

/// 以结构化日志输出运行耗时与结果
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

#[async_trait]
impl RunTelemetry for TracingTelemetry {
    async fn record_completion(&self, run: &SubagentRun) -> anyhow::Result<()> {
        let status = match &run.outcome {
            Some(outcome) if outcome.is_ok() => "ok",
            Some(_) => "error",
            None => "unknown",
        };
        tracing::info!(
            "Subagent run {} completed: status={} duration_ms={} retries={} requester={}",
            run.run_id,
            status,
            run.duration_ms().unwrap_or(0),
            run.retry_count,
            run.requester_session_key
        );
        Ok(())
    }
}
