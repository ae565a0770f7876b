//! 失败重试
//!
//! 读取失败子会话的 transcript 摘要，拼出带上下文的重试任务，以新的子会话重新派生，
//! 并把新运行登记为原运行的重试（retryOf）。任何一步失败都退回到通知原运行的失败结果。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::registry::SubagentRegistry;
use super::run::{retry_label, CleanupMode, RegisterRunParams, RunOutcome, SubagentRun};
use super::session_key::{new_subagent_session_key, resolve_agent_id};
use crate::core::{spawn_best_effort, SubagentError};
use crate::gateway::{chat_history, delete_session, spawn_agent, DeliveryContext, GatewayRpc, SpawnAgentParams};

/// 摘要中保留的最后一条助手输出的最大字符数
const MAX_SUMMARY_TEXT_CHARS: usize = 2_000;

/// 重试任务里列出的工具调用数上限
const MAX_LISTED_TOOL_CALLS: usize = 20;

const SUMMARY_HISTORY_LIMIT: usize = 200;

/// 失败会话的 transcript 摘要
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptSummary {
    /// 按调用顺序的工具名
    pub tool_calls: Vec<String>,
    pub tool_error_count: usize,
    pub last_assistant_text: Option<String>,
    pub total_messages: usize,
}

#[async_trait]
pub trait TranscriptSummarizer: Send + Sync {
    async fn summarize(&self, session_key: &str) -> anyhow::Result<TranscriptSummary>;
}

/// 通过 `chat.history` 读取会话并提取摘要
pub struct GatewayTranscriptSummarizer {
    gateway: Arc<dyn GatewayRpc>,
}

impl GatewayTranscriptSummarizer {
    pub fn new(gateway: Arc<dyn GatewayRpc>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl TranscriptSummarizer for GatewayTranscriptSummarizer {
    async fn summarize(&self, session_key: &str) -> anyhow::Result<TranscriptSummary> {
        let messages = chat_history(self.gateway.as_ref(), session_key, SUMMARY_HISTORY_LIMIT).await?;
        Ok(summarize_messages(&messages))
    }
}

/// 从 transcript 消息中提取摘要
///
/// 支持 `content` 为字符串或内容块数组（`text` / `toolCall` / `tool_use`）；
/// 角色为 `toolResult` / `tool` 且 `isError` 为真的消息计为工具错误。
pub fn summarize_messages(messages: &[Value]) -> TranscriptSummary {
    let mut summary = TranscriptSummary {
        total_messages: messages.len(),
        ..Default::default()
    };

    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or_default();
        match role {
            "assistant" => {
                let content = message.get("content");
                if let Some(Value::Array(blocks)) = content {
                    for block in blocks {
                        let kind = block.get("type").and_then(Value::as_str).unwrap_or_default();
                        if matches!(kind, "toolCall" | "tool_use") {
                            if let Some(name) = block.get("name").and_then(Value::as_str) {
                                summary.tool_calls.push(name.to_string());
                            }
                        }
                    }
                }
                let text = extract_text(content);
                if !text.is_empty() {
                    summary.last_assistant_text = Some(text);
                }
            }
            "toolResult" | "tool" => {
                if message.get("isError").and_then(Value::as_bool).unwrap_or(false) {
                    summary.tool_error_count += 1;
                }
            }
            _ => {}
        }
    }
    summary
}

fn extract_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// 重试任务的输入
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    pub original_task: &'a str,
    pub summary: &'a TranscriptSummary,
    pub retry_number: u32,
    pub max_retries: u32,
    pub failure_reason: Option<&'a str>,
}

/// 拼出带上一次尝试上下文的重试任务
pub fn format_retry_task(ctx: &RetryContext<'_>) -> String {
    let mut lines = vec![format!("# Retry {}/{}", ctx.retry_number, ctx.max_retries), String::new()];
    match ctx.failure_reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reason) => lines.push(format!("The previous attempt at this task failed: {}", reason)),
        None => lines.push("The previous attempt at this task failed.".to_string()),
    }

    lines.push(String::new());
    lines.push("## Original task".to_string());
    lines.push(ctx.original_task.trim().to_string());

    let summary = ctx.summary;
    if summary.total_messages > 0 {
        lines.push(String::new());
        lines.push("## What the previous attempt did".to_string());
        lines.push(format!("- Messages exchanged: {}", summary.total_messages));
        if !summary.tool_calls.is_empty() {
            let shown: Vec<&str> = summary
                .tool_calls
                .iter()
                .take(MAX_LISTED_TOOL_CALLS)
                .map(String::as_str)
                .collect();
            let more = summary.tool_calls.len().saturating_sub(shown.len());
            let suffix = if more > 0 { format!(" (+{} more)", more) } else { String::new() };
            lines.push(format!("- Tool calls: {}{}", shown.join(", "), suffix));
        }
        if summary.tool_error_count > 0 {
            lines.push(format!("- Tool errors: {}", summary.tool_error_count));
        }
        if let Some(text) = summary.last_assistant_text.as_deref() {
            lines.push("- Last output before failing:".to_string());
            lines.push(String::new());
            for line in truncate_chars(text, MAX_SUMMARY_TEXT_CHARS).lines() {
                lines.push(format!("> {}", line));
            }
        }
    }

    lines.push(String::new());
    lines.push("## Instructions".to_string());
    lines.push(
        "Pick up from where the previous attempt stopped. Do not repeat steps that already failed; \
         try a different approach where needed and complete the original task."
            .to_string(),
    );
    lines.join("\n")
}

/// 子会话的附加系统提示
pub fn build_subagent_system_prompt(
    requester_session_key: &str,
    requester_origin: Option<&DeliveryContext>,
    child_session_key: &str,
    label: Option<&str>,
    task: &str,
) -> String {
    let task_text = task.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut lines = vec![
        "# Subagent Context".to_string(),
        String::new(),
        "You are a subagent spawned by the main agent for a specific task.".to_string(),
        String::new(),
        "## Your Role".to_string(),
        format!("- You were created to handle: {}", task_text),
        "- Complete this task; your final reply is relayed back to the requester.".to_string(),
        String::new(),
        "## Rules".to_string(),
        "1. Stay focused on the assigned task and do not start unrelated work.".to_string(),
        "2. Do not message the user directly.".to_string(),
        "3. Lead your final reply with the result.".to_string(),
        String::new(),
        "## Session Context".to_string(),
    ];
    if let Some(label) = label {
        lines.push(format!("- Label: {}", label));
    }
    lines.push(format!("- Requester session: {}", requester_session_key));
    if let Some(channel) = requester_origin.and_then(|o| o.channel.as_deref()) {
        lines.push(format!("- Requester channel: {}", channel));
    }
    lines.push(format!("- Your session: {}", child_session_key));
    lines.join("\n")
}

impl SubagentRegistry {
    /// 执行重试；成功后移除原记录，失败时通知原记录的失败结果
    pub(crate) async fn retry_run(&self, failed: SubagentRun) {
        match self.spawn_retry(&failed).await {
            Ok(retry) => {
                tracing::info!(
                    "Subagent run {} failed, retrying as {} ({}/{})",
                    failed.run_id,
                    retry.run_id,
                    retry.retry_count,
                    retry.max_retries
                );
                self.remove(&failed.run_id).await;
                if failed.cleanup == CleanupMode::Delete {
                    let gateway = Arc::clone(&self.inner.gateway);
                    let key = failed.child_session_key.clone();
                    spawn_best_effort("failed child session delete", async move {
                        delete_session(gateway.as_ref(), &key).await?;
                        Ok(())
                    });
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Retry of subagent run {} failed, announcing original failure: {}",
                    failed.run_id,
                    e
                );
                self.run_cleanup_flow(&failed.run_id).await;
            }
        }
    }

    async fn spawn_retry(&self, failed: &SubagentRun) -> Result<SubagentRun, SubagentError> {
        let retry_number = failed.retry_count + 1;

        let summary = match self.inner.summarizer.summarize(&failed.child_session_key).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!(
                    "Transcript summary for {} unavailable, retrying without it: {:#}",
                    failed.child_session_key,
                    e
                );
                TranscriptSummary::default()
            }
        };
        let retry_task = format_retry_task(&RetryContext {
            original_task: &failed.original_task,
            summary: &summary,
            retry_number,
            max_retries: failed.max_retries,
            failure_reason: failed.outcome.as_ref().and_then(RunOutcome::error_message),
        });

        let agent_id = resolve_agent_id(&failed.child_session_key);
        let message = match self.inner.settings.task_directives.get(&agent_id) {
            Some(directive) => format!("{}\n\n---\n\n{}", retry_task, directive),
            None => retry_task.clone(),
        };
        let child_session_key = new_subagent_session_key(&agent_id);
        let label = retry_label(failed.label.as_deref(), retry_number);
        let system_prompt = build_subagent_system_prompt(
            &failed.requester_session_key,
            failed.requester_origin.as_ref(),
            &child_session_key,
            label.as_deref(),
            &retry_task,
        );

        let mut spawn = SpawnAgentParams::new(
            message,
            child_session_key.as_str(),
            uuid::Uuid::new_v4().to_string(),
            system_prompt,
        )
        .with_origin(failed.requester_origin.as_ref());
        spawn.label = label.clone();
        spawn.model = failed.model.clone();
        spawn.timeout = failed.run_timeout_seconds;
        let run_id = spawn_agent(self.inner.gateway.as_ref(), &spawn).await?;

        let mut params = RegisterRunParams::new(
            run_id,
            child_session_key,
            failed.requester_session_key.as_str(),
            retry_task,
        )
        .with_display_key(failed.requester_display_key.as_str())
        .with_cleanup(failed.cleanup)
        .with_max_retries(failed.max_retries);
        params.requester_origin = failed.requester_origin.clone();
        params.original_task = Some(failed.original_task.clone());
        params.label = label;
        params.model = failed.model.clone();
        params.run_timeout_seconds = failed.run_timeout_seconds;
        params.retry_count = retry_number;
        params.retry_of = Some(failed.run_id.clone());
        self.register(params).await
    }
}
