//! 运行登记表的落盘
//!
//! 整张表作为单个 JSON 文档读写：`{"version": 1, "runs": {runId: SubagentRun}}`。
//! 旧版本直接存 `{runId: SubagentRun}`，加载时同样接受。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::run::SubagentRun;
use crate::core::StoreError;

/// runId -> 运行记录
pub type RunMap = HashMap<String, SubagentRun>;

const REGISTRY_VERSION: u32 = 1;

/// 登记表持久化接口
pub trait RunStore: Send + Sync {
    fn load(&self) -> Result<RunMap, StoreError>;

    fn save(&self, runs: &RunMap) -> Result<(), StoreError>;
}

#[derive(Serialize)]
struct PersistedRegistryRef<'a> {
    version: u32,
    runs: &'a RunMap,
}

#[derive(Deserialize)]
struct PersistedRegistry {
    #[serde(default)]
    runs: RunMap,
}

/// JSON 文件存储；写入先落临时文件再 rename
#[derive(Debug)]
pub struct JsonFileRunStore {
    path: PathBuf,
}

impl JsonFileRunStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunStore for JsonFileRunStore {
    /// 文件不存在时返回空表
    fn load(&self) -> Result<RunMap, StoreError> {
        if !self.path.exists() {
            return Ok(RunMap::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        if data.trim().is_empty() {
            return Ok(RunMap::new());
        }
        let value: Value = serde_json::from_str(&data)?;
        let versioned = value.get("version").is_some() && value.get("runs").is_some();
        let runs = if versioned {
            serde_json::from_value::<PersistedRegistry>(value)?.runs
        } else {
            serde_json::from_value::<RunMap>(value)?
        };
        Ok(runs)
    }

    fn save(&self, runs: &RunMap) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let doc = PersistedRegistryRef {
            version: REGISTRY_VERSION,
            runs,
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// 内存存储（测试与无盘部署）；记录保存次数
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<RunMap>,
    saves: AtomicUsize,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一份“上次进程留下的”登记表
    pub fn with_runs(runs: impl IntoIterator<Item = SubagentRun>) -> Self {
        let map = runs.into_iter().map(|r| (r.run_id.clone(), r)).collect();
        Self {
            runs: Mutex::new(map),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> RunMap {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl RunStore for MemoryRunStore {
    fn load(&self) -> Result<RunMap, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, runs: &RunMap) -> Result<(), StoreError> {
        if let Ok(mut stored) = self.runs.lock() {
            *stored = runs.clone();
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subagent::run::{CleanupMode, RunOutcome};

    fn sample(run_id: &str) -> SubagentRun {
        SubagentRun {
            run_id: run_id.into(),
            child_session_key: format!("agent:main:subagent:{}", run_id),
            requester_session_key: "agent:main:main".into(),
            requester_display_key: "main".into(),
            requester_origin: None,
            task: "task".into(),
            original_task: "task".into(),
            cleanup: CleanupMode::Delete,
            label: Some("label".into()),
            model: None,
            run_timeout_seconds: None,
            created_at: 1,
            started_at: Some(1),
            ended_at: Some(2),
            outcome: Some(RunOutcome::Ok),
            archive_at_ms: None,
            cleanup_handled: true,
            cleanup_completed_at: None,
            retry_handled: false,
            retry_count: 0,
            max_retries: 0,
            retry_of: None,
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileRunStore::new(dir.path().join("none.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileRunStore::new(dir.path().join("nested/subagents/runs.json"));

        let mut runs = RunMap::new();
        runs.insert("a".into(), sample("a"));
        runs.insert("b".into(), sample("b"));
        store.save(&runs).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert!(raw["runs"]["a"].is_object());

        let loaded = store.load().unwrap();
        assert_eq!(loaded, runs);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_legacy_bare_map_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");
        let mut runs = RunMap::new();
        runs.insert("legacy".into(), sample("legacy"));
        std::fs::write(&path, serde_json::to_string(&runs).unwrap()).unwrap();

        let loaded = JsonFileRunStore::new(&path).load().unwrap();
        assert_eq!(loaded.get("legacy").unwrap().label.as_deref(), Some("label"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(JsonFileRunStore::new(&path).load(), Err(StoreError::Serde(_))));
    }

    #[test]
    fn test_memory_store_counts_saves() {
        let store = MemoryRunStore::with_runs([sample("x")]);
        assert_eq!(store.load().unwrap().len(), 1);
        store.save(&RunMap::new()).unwrap();
        assert_eq!(store.save_count(), 1);
        assert!(store.snapshot().is_empty());
    }
}
