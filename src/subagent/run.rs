//! 子智能体运行记录
//!
//! 一条记录对应一次派生出去的子会话运行，从派生一直存活到通知完成并被回收。
//! 磁盘格式使用 camelCase 字段名。

use serde::{Deserialize, Serialize};

use crate::core::SubagentError;
use crate::gateway::DeliveryContext;

/// 当前毫秒时间戳
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 通知完成后记录的去留
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// 通知后立即删除记录
    Delete,
    /// 通知成功后保留到归档期满
    #[default]
    Keep,
}

/// 运行终态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Ok,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunOutcome {
    pub fn error(message: Option<String>) -> Self {
        RunOutcome::Error { error: message }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RunOutcome::Ok)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            RunOutcome::Ok => None,
            RunOutcome::Error { error } => error.as_deref(),
        }
    }
}

/// 运行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRun {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_display_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_origin: Option<DeliveryContext>,
    /// 实际下发的任务（重试时包含上一次的上下文）
    pub task: String,
    /// 最初的任务原文
    pub original_task: String,
    #[serde(default)]
    pub cleanup: CleanupMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// 单次运行超时覆盖（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_at_ms: Option<i64>,
    /// 通知/清理的认领标记
    #[serde(default)]
    pub cleanup_handled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_completed_at: Option<i64>,
    /// 重试的认领标记（每条失败记录最多重试一次）
    #[serde(default)]
    pub retry_handled: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// 本次运行重试的是哪条运行
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
}

impl SubagentRun {
    /// 失败且仍有重试额度
    pub fn should_retry(&self) -> bool {
        match &self.outcome {
            Some(outcome) if !outcome.is_ok() => {
                self.max_retries > 0 && self.retry_count < self.max_retries
            }
            _ => false,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn is_cleanup_completed(&self) -> bool {
        self.cleanup_completed_at.is_some()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).max(0)),
            _ => None,
        }
    }
}

/// 登记参数
#[derive(Debug, Clone)]
pub struct RegisterRunParams {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_display_key: String,
    pub requester_origin: Option<DeliveryContext>,
    pub task: String,
    /// 未设置时等于 task
    pub original_task: Option<String>,
    pub cleanup: CleanupMode,
    pub label: Option<String>,
    pub model: Option<String>,
    pub run_timeout_seconds: Option<u64>,
    pub retry_count: u32,
    /// 未设置时取配置默认值
    pub max_retries: Option<u32>,
    pub retry_of: Option<String>,
}

impl RegisterRunParams {
    pub fn new(
        run_id: impl Into<String>,
        child_session_key: impl Into<String>,
        requester_session_key: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        let requester_session_key = requester_session_key.into();
        Self {
            run_id: run_id.into(),
            child_session_key: child_session_key.into(),
            requester_display_key: requester_session_key.clone(),
            requester_session_key,
            requester_origin: None,
            task: task.into(),
            original_task: None,
            cleanup: CleanupMode::default(),
            label: None,
            model: None,
            run_timeout_seconds: None,
            retry_count: 0,
            max_retries: None,
            retry_of: None,
        }
    }

    pub fn with_cleanup(mut self, cleanup: CleanupMode) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_origin(mut self, origin: DeliveryContext) -> Self {
        self.requester_origin = Some(origin);
        self
    }

    pub fn with_display_key(mut self, display_key: impl Into<String>) -> Self {
        self.requester_display_key = display_key.into();
        self
    }

    pub fn with_run_timeout_seconds(mut self, seconds: u64) -> Self {
        self.run_timeout_seconds = Some(seconds);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), SubagentError> {
        let required = [
            ("runId", &self.run_id),
            ("childSessionKey", &self.child_session_key),
            ("requesterSessionKey", &self.requester_session_key),
            ("task", &self.task),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(SubagentError::InvalidRegistration(format!("{} must not be empty", name)));
            }
        }
        if self.max_retries.is_some_and(|max| self.retry_count > max) {
            return Err(SubagentError::InvalidRegistration(format!(
                "retryCount {} exceeds maxRetries",
                self.retry_count
            )));
        }
        Ok(())
    }
}

/// 重试标签：去掉已有的 " (retry N)" 后缀再追加新的
pub fn retry_label(label: Option<&str>, retry_number: u32) -> Option<String> {
    let label = label?.trim();
    if label.is_empty() {
        return None;
    }
    let base = match label.rfind(" (retry ") {
        Some(idx) if label.ends_with(')') => &label[..idx],
        _ => label,
    };
    Some(format!("{} (retry {})", base, retry_number))
}
