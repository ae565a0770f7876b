//! 子智能体运行登记表
//!
//! 内存中的 runId -> 记录 映射，每次可被重启观察到的修改后整体落盘。
//! 所有“检查再设置”（终态写入、清理认领、重试认领）及其落盘都在同一把锁内完成。
//!
//! 登记表是一个可注入的对象而非全局状态：`init` 从磁盘恢复，`reset` 清空内存，
//! 同一进程里可以并存多个互不相干的实例。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::cleanup::Announcer;
use super::retry::TranscriptSummarizer;
use super::run::{now_ms, RegisterRunParams, SubagentRun};
use super::store::{RunMap, RunStore};
use super::telemetry::RunTelemetry;
use crate::config::AppConfig;
use crate::core::{StoreError, SubagentError};
use crate::gateway::{AgentEventBus, DeliveryContext, GatewayRpc};

/// 完成拦截器：返回 true 表示由外部接管该运行的后续处理（重试、通知、清理）
pub type CompletionInterceptor = Arc<dyn Fn(&str, &SubagentRun) -> bool + Send + Sync>;

/// 运行超时配置为 0 时 agent.wait 的上限（30 天）
pub const MAX_WAIT_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// 登记表的运行参数（由 AppConfig 派生）
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// keep 模式记录的归档 TTL；None 表示不归档
    pub archive_after_ms: Option<i64>,
    pub default_max_retries: u32,
    /// 0 表示不限（按 MAX_WAIT_MS 封顶）
    pub agent_timeout_ms: u64,
    pub sweep_interval: Duration,
    /// agent id（小写）-> 重试任务追加的指令
    pub task_directives: HashMap<String, String>,
    /// 同一请求方会话下同时未结束的子运行上限
    pub max_children_per_agent: usize,
    /// 请求方 agent id（小写）-> 可派生的其他 agent；"*" 表示任意
    pub allow_agents: HashMap<String, Vec<String>>,
}

impl From<&AppConfig> for RegistrySettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            archive_after_ms: config.archive_after_ms(),
            default_max_retries: config.agents.defaults.subagents.max_retries,
            agent_timeout_ms: config.agent_timeout_ms(),
            sweep_interval: Duration::from_secs(config.registry.sweep_interval_secs.max(1)),
            task_directives: config.task_directives(),
            max_children_per_agent: config.agents.defaults.subagents.max_children_per_agent,
            allow_agents: config.allow_agents(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// 登记表依赖的外部协作者
pub struct RegistryDeps {
    pub gateway: Arc<dyn GatewayRpc>,
    pub events: AgentEventBus,
    pub store: Arc<dyn RunStore>,
    pub announcer: Arc<dyn Announcer>,
    pub summarizer: Arc<dyn TranscriptSummarizer>,
    pub telemetry: Option<Arc<dyn RunTelemetry>>,
    pub settings: RegistrySettings,
}

pub(crate) struct RegistryInner {
    pub(crate) runs: Mutex<RunMap>,
    /// 已发起过完成等待（或已进入恢复流程）的 runId
    pub(crate) resumed: StdMutex<HashSet<String>>,
    pub(crate) restored: AtomicBool,
    pub(crate) interceptor: RwLock<Option<CompletionInterceptor>>,
    pub(crate) listener: StdMutex<Option<JoinHandle<()>>>,
    pub(crate) sweeper: StdMutex<Option<JoinHandle<()>>>,
    pub(crate) gateway: Arc<dyn GatewayRpc>,
    pub(crate) events: AgentEventBus,
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) announcer: Arc<dyn Announcer>,
    pub(crate) summarizer: Arc<dyn TranscriptSummarizer>,
    pub(crate) telemetry: Option<Arc<dyn RunTelemetry>>,
    pub(crate) settings: RegistrySettings,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for slot in [&self.listener, &self.sweeper] {
            if let Some(handle) = lock_std(slot).take() {
                handle.abort();
            }
        }
    }
}

/// 同步锁；中毒时沿用内部数据
pub(crate) fn lock_std<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 子智能体运行登记表（可克隆，所有克隆共享同一份状态）
#[derive(Clone)]
pub struct SubagentRegistry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl SubagentRegistry {
    pub fn new(deps: RegistryDeps) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                runs: Mutex::new(RunMap::new()),
                resumed: StdMutex::new(HashSet::new()),
                restored: AtomicBool::new(false),
                interceptor: RwLock::new(None),
                listener: StdMutex::new(None),
                sweeper: StdMutex::new(None),
                gateway: deps.gateway,
                events: deps.events,
                store: deps.store,
                announcer: deps.announcer,
                summarizer: deps.summarizer,
                telemetry: deps.telemetry,
                settings: deps.settings,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<RegistryInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    /// 从磁盘恢复并重新挂上完成等待；每个实例只执行一次
    pub async fn init(&self) {
        self.restore().await;
    }

    /// 登记一次新派生的运行
    ///
    /// 校验必填字段后写入内存并落盘，确保生命周期监听已启动，
    /// 配置了归档时启动清扫任务，最后发起跨进程的完成等待。
    pub async fn register(&self, params: RegisterRunParams) -> Result<SubagentRun, SubagentError> {
        params.validate()?;

        let settings = &self.inner.settings;
        let created_at = now_ms();
        let original_task = params
            .original_task
            .filter(|task| !task.trim().is_empty())
            .unwrap_or_else(|| params.task.clone());
        let run = SubagentRun {
            run_id: params.run_id.trim().to_string(),
            child_session_key: params.child_session_key.trim().to_string(),
            requester_session_key: params.requester_session_key.trim().to_string(),
            requester_display_key: params.requester_display_key,
            requester_origin: DeliveryContext::normalize(params.requester_origin),
            task: params.task,
            original_task,
            cleanup: params.cleanup,
            label: params
                .label
                .map(|label| label.trim().to_string())
                .filter(|label| !label.is_empty()),
            model: params.model,
            run_timeout_seconds: params.run_timeout_seconds,
            created_at,
            started_at: Some(created_at),
            ended_at: None,
            outcome: None,
            archive_at_ms: settings.archive_after_ms.map(|ttl| created_at.saturating_add(ttl)),
            cleanup_handled: false,
            cleanup_completed_at: None,
            retry_handled: false,
            retry_count: params.retry_count,
            max_retries: params.max_retries.unwrap_or(settings.default_max_retries),
            retry_of: params.retry_of,
        };

        {
            let mut runs = self.inner.runs.lock().await;
            if runs.contains_key(&run.run_id) {
                return Err(SubagentError::DuplicateRun(run.run_id));
            }
            runs.insert(run.run_id.clone(), run.clone());
            self.persist(&runs);
        }

        tracing::info!(
            "Registered subagent run {} (child {}, requester {})",
            run.run_id,
            run.child_session_key,
            run.requester_session_key
        );

        self.mark_resumed(&run.run_id);
        self.ensure_listener();
        if run.archive_at_ms.is_some() {
            self.ensure_sweeper();
        }
        self.spawn_completion_wait(run.run_id.clone(), self.wait_timeout_ms(&run));
        Ok(run)
    }

    pub async fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.inner.runs.lock().await.get(run_id).cloned()
    }

    /// 删除记录并落盘
    pub async fn remove(&self, run_id: &str) -> Option<SubagentRun> {
        let mut runs = self.inner.runs.lock().await;
        let removed = runs.remove(run_id)?;
        self.persist(&runs);
        Some(removed)
    }

    /// 外部请求释放一条运行（如用户手动删除子会话）
    pub async fn release(&self, run_id: &str) -> Option<SubagentRun> {
        let removed = self.remove(run_id).await;
        if removed.is_some() {
            tracing::debug!("Released subagent run {}", run_id);
        }
        removed
    }

    /// 全部记录，按创建时间排序
    pub async fn list(&self) -> Vec<SubagentRun> {
        let mut runs: Vec<SubagentRun> = self.inner.runs.lock().await.values().cloned().collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    pub async fn list_for_requester(&self, requester_session_key: &str) -> Vec<SubagentRun> {
        let key = requester_session_key.trim();
        if key.is_empty() {
            return Vec::new();
        }
        let mut runs: Vec<SubagentRun> = self
            .inner
            .runs
            .lock()
            .await
            .values()
            .filter(|run| run.requester_session_key == key)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.created_at);
        runs
    }

    /// 某个请求方会话下尚未结束的运行数
    pub async fn count_active_for_session(&self, requester_session_key: &str) -> usize {
        let key = requester_session_key.trim();
        self.inner
            .runs
            .lock()
            .await
            .values()
            .filter(|run| run.requester_session_key == key && run.ended_at.is_none())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.inner.runs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.runs.lock().await.is_empty()
    }

    pub fn set_completion_interceptor(&self, interceptor: Option<CompletionInterceptor>) {
        match self.inner.interceptor.write() {
            Ok(mut slot) => *slot = interceptor,
            Err(poisoned) => *poisoned.into_inner() = interceptor,
        }
    }

    pub(crate) fn interceptor(&self) -> Option<CompletionInterceptor> {
        match self.inner.interceptor.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 立即把内存中的登记表写盘（关闭时调用）
    pub async fn flush(&self) -> Result<(), StoreError> {
        let runs = self.inner.runs.lock().await;
        self.inner.store.save(&runs)
    }

    /// 停止生命周期监听与清扫任务；已发起的等待不受影响
    pub fn shutdown(&self) {
        for slot in [&self.inner.listener, &self.inner.sweeper] {
            if let Some(handle) = lock_std(slot).take() {
                handle.abort();
            }
        }
    }

    /// 清空内存状态（不触碰磁盘），之后可再次 `init`
    pub async fn reset(&self) {
        self.shutdown();
        self.inner.runs.lock().await.clear();
        lock_std(&self.inner.resumed).clear();
        self.inner.restored.store(false, Ordering::SeqCst);
        self.set_completion_interceptor(None);
    }

    /// 落盘失败只记录日志，内存仍是本进程的权威状态
    pub(crate) fn persist(&self, runs: &RunMap) {
        if let Err(e) = self.inner.store.save(runs) {
            tracing::warn!("Failed to persist subagent registry: {}", e);
        }
    }

    /// 首次标记返回 true
    pub(crate) fn mark_resumed(&self, run_id: &str) -> bool {
        lock_std(&self.inner.resumed).insert(run_id.to_string())
    }

    /// agent.wait 的等待时长：单次覆盖优先，其次 agent 默认；0 按上限处理
    pub(crate) fn wait_timeout_ms(&self, run: &SubagentRun) -> u64 {
        let timeout_ms = match run.run_timeout_seconds {
            Some(seconds) => seconds.saturating_mul(1000),
            None => self.inner.settings.agent_timeout_ms,
        };
        if timeout_ms == 0 {
            MAX_WAIT_MS
        } else {
            timeout_ms.min(MAX_WAIT_MS)
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::core::GatewayError;
    use crate::subagent::cleanup::AnnounceRequest;
    use crate::subagent::retry::TranscriptSummary;
    use crate::subagent::store::MemoryRunStore;
    use crate::subagent::CleanupMode;

    /// agent.wait 一直挂起，其余方法直接成功
    struct PendingGateway;

    #[async_trait]
    impl GatewayRpc for PendingGateway {
        async fn call(&self, method: &str, _params: Value, _timeout: Duration) -> Result<Value, GatewayError> {
            if method == "agent.wait" {
                std::future::pending::<()>().await;
            }
            Ok(json!({}))
        }
    }

    struct NoopAnnouncer;

    #[async_trait]
    impl Announcer for NoopAnnouncer {
        async fn announce(&self, _request: AnnounceRequest) -> bool {
            true
        }
    }

    struct EmptySummarizer;

    #[async_trait]
    impl TranscriptSummarizer for EmptySummarizer {
        async fn summarize(&self, _session_key: &str) -> anyhow::Result<TranscriptSummary> {
            Ok(TranscriptSummary::default())
        }
    }

    fn registry_with(store: Arc<MemoryRunStore>, settings: RegistrySettings) -> SubagentRegistry {
        SubagentRegistry::new(RegistryDeps {
            gateway: Arc::new(PendingGateway),
            events: AgentEventBus::default(),
            store,
            announcer: Arc::new(NoopAnnouncer),
            summarizer: Arc::new(EmptySummarizer),
            telemetry: None,
            settings,
        })
    }

    #[tokio::test]
    async fn test_register_fills_defaults_and_persists() {
        let store = Arc::new(MemoryRunStore::new());
        let mut settings = RegistrySettings::default();
        settings.default_max_retries = 2;
        settings.archive_after_ms = Some(60_000);
        let registry = registry_with(Arc::clone(&store), settings);

        let origin = DeliveryContext {
            channel: Some(" Discord ".into()),
            to: Some("".into()),
            ..Default::default()
        };
        let run = registry
            .register(
                RegisterRunParams::new("run-1", "agent:main:subagent:a", "agent:main:main", "collect data")
                    .with_label("  collector ")
                    .with_origin(origin),
            )
            .await
            .unwrap();

        assert_eq!(run.original_task, "collect data");
        assert_eq!(run.label.as_deref(), Some("collector"));
        assert_eq!(run.max_retries, 2);
        assert_eq!(run.cleanup, CleanupMode::Keep);
        assert_eq!(run.archive_at_ms, Some(run.created_at + 60_000));
        assert_eq!(run.requester_origin.as_ref().and_then(|o| o.channel.as_deref()), Some("discord"));
        assert!(run.requester_origin.as_ref().is_some_and(|o| o.to.is_none()));

        assert_eq!(store.save_count(), 1);
        assert!(store.snapshot().contains_key("run-1"));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_blank_fields() {
        let registry = registry_with(Arc::new(MemoryRunStore::new()), RegistrySettings::default());
        let params = RegisterRunParams::new("run-1", "child", "requester", "task");
        registry.register(params.clone()).await.unwrap();

        assert!(matches!(
            registry.register(params).await,
            Err(SubagentError::DuplicateRun(id)) if id == "run-1"
        ));
        assert!(matches!(
            registry.register(RegisterRunParams::new("", "child", "requester", "task")).await,
            Err(SubagentError::InvalidRegistration(_))
        ));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_queries_by_requester() {
        let registry = registry_with(Arc::new(MemoryRunStore::new()), RegistrySettings::default());
        for (id, requester) in [("a", "req-1"), ("b", "req-1"), ("c", "req-2")] {
            registry
                .register(RegisterRunParams::new(id, format!("child-{}", id), requester, "task"))
                .await
                .unwrap();
        }
        assert_eq!(registry.list().await.len(), 3);
        assert_eq!(registry.list_for_requester("req-1").await.len(), 2);
        assert!(registry.list_for_requester("  ").await.is_empty());
        assert_eq!(registry.count_active_for_session("req-1").await, 2);

        assert!(registry.release("a").await.is_some());
        assert!(registry.release("a").await.is_none());
        assert_eq!(registry.count_active_for_session("req-1").await, 1);
    }

    #[tokio::test]
    async fn test_wait_timeout_resolution() {
        let mut settings = RegistrySettings::default();
        settings.agent_timeout_ms = 0;
        let registry = registry_with(Arc::new(MemoryRunStore::new()), settings);

        let run = registry
            .register(RegisterRunParams::new("r", "child", "req", "task"))
            .await
            .unwrap();
        assert_eq!(registry.wait_timeout_ms(&run), MAX_WAIT_MS);

        let run = registry
            .register(RegisterRunParams::new("r2", "child", "req", "task").with_run_timeout_seconds(30))
            .await
            .unwrap();
        assert_eq!(registry.wait_timeout_ms(&run), 30_000);
    }

    fn sweeper_running(registry: &SubagentRegistry) -> bool {
        lock_std(&registry.inner.sweeper)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    #[tokio::test]
    async fn test_sweeper_ticks_and_stops_when_empty() {
        let store = Arc::new(MemoryRunStore::new());
        let mut settings = RegistrySettings::default();
        settings.archive_after_ms = Some(1);
        settings.sweep_interval = Duration::from_millis(20);
        let registry = registry_with(Arc::clone(&store), settings);

        registry
            .register(RegisterRunParams::new("r", "child", "req", "task"))
            .await
            .unwrap();
        assert!(sweeper_running(&registry));

        for _ in 0..100 {
            if registry.is_empty().await && lock_std(&registry.inner.sweeper).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty().await);
        assert!(lock_std(&registry.inner.sweeper).is_none());
        assert!(store.snapshot().is_empty());

        // 再次登记时重新启动
        registry
            .register(RegisterRunParams::new("r2", "child", "req", "task"))
            .await
            .unwrap();
        assert!(sweeper_running(&registry));
    }

    #[tokio::test]
    async fn test_archive_time_saturates() {
        let mut settings = RegistrySettings::default();
        settings.archive_after_ms = Some(i64::MAX);
        let registry = registry_with(Arc::new(MemoryRunStore::new()), settings);

        let run = registry
            .register(RegisterRunParams::new("r", "child", "req", "task"))
            .await
            .unwrap();
        assert_eq!(run.archive_at_ms, Some(i64::MAX));
        assert_eq!(registry.sweep_at(now_ms()).await, 0);
    }

    #[tokio::test]
    async fn test_reset_clears_memory_only() {
        let store = Arc::new(MemoryRunStore::new());
        let registry = registry_with(Arc::clone(&store), RegistrySettings::default());
        registry
            .register(RegisterRunParams::new("r", "child", "req", "task"))
            .await
            .unwrap();
        registry.set_completion_interceptor(Some(Arc::new(|_: &str, _: &SubagentRun| true)));

        registry.reset().await;
        assert!(registry.is_empty().await);
        assert!(registry.interceptor().is_none());
        assert_eq!(store.snapshot().len(), 1);
    }
}
