//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__GATEWAY__URL=ws://...`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub agents: AgentsSection,
}

/// [gateway] 段：网关地址、鉴权与 RPC 超时
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    pub token: Option<String>,
    /// 普通 RPC 调用超时（秒）；agent.wait 另按运行超时计算
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:18789".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl GatewaySection {
    /// 普通 RPC 的超时，至少 1 秒
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// [registry] 段：运行登记表的落盘位置与清扫周期
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    /// 未设置时用 ./data/subagents/runs.json
    pub path: Option<PathBuf>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            path: None,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RegistrySection {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from("data/subagents/runs.json"))
    }
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// [agents] 段：默认值 + 每个 agent 的覆盖项
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentsSection {
    #[serde(default)]
    pub defaults: AgentDefaults,
    #[serde(default)]
    pub list: Vec<AgentEntry>,
}

/// [agents.defaults] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AgentDefaults {
    /// 单次运行超时（秒），0 表示不限
    #[serde(default = "default_agent_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub subagents: SubagentDefaults,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            timeout_seconds: default_agent_timeout_seconds(),
            subagents: SubagentDefaults::default(),
        }
    }
}

fn default_agent_timeout_seconds() -> u64 {
    600
}

/// [agents.defaults.subagents] 段：归档 TTL、重试上限与并发子运行上限
#[derive(Debug, Clone, Deserialize)]
pub struct SubagentDefaults {
    /// keep 模式的运行在通知成功后保留多少分钟；0 表示不归档
    #[serde(default = "default_archive_after_minutes")]
    pub archive_after_minutes: u64,
    #[serde(default)]
    pub max_retries: u32,
    /// 同一请求方会话下同时未结束的子运行上限
    #[serde(default = "default_max_children_per_agent")]
    pub max_children_per_agent: usize,
}

impl Default for SubagentDefaults {
    fn default() -> Self {
        Self {
            archive_after_minutes: default_archive_after_minutes(),
            max_retries: 0,
            max_children_per_agent: default_max_children_per_agent(),
        }
    }
}

fn default_archive_after_minutes() -> u64 {
    60
}

fn default_max_children_per_agent() -> usize {
    5
}

/// [[agents.list]]：单个 agent 的配置
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    /// 重试任务末尾追加的指令
    pub task_directive: Option<String>,
    /// 该 agent 可以派生到哪些其他 agent；"*" 表示任意
    #[serde(default)]
    pub allow_agents: Vec<String>,
}

impl AppConfig {
    /// 归档 TTL（毫秒）；未配置时为 None
    pub fn archive_after_ms(&self) -> Option<i64> {
        match self.agents.defaults.subagents.archive_after_minutes {
            0 => None,
            minutes => Some(
                i64::try_from(minutes)
                    .unwrap_or(i64::MAX)
                    .saturating_mul(60_000),
            ),
        }
    }

    pub fn agent_timeout_ms(&self) -> u64 {
        self.agents.defaults.timeout_seconds.saturating_mul(1000)
    }

    /// agent id（小写）-> 任务指令；空白指令忽略
    pub fn task_directives(&self) -> HashMap<String, String> {
        self.agents
            .list
            .iter()
            .filter_map(|entry| {
                let directive = entry.task_directive.as_deref()?.trim();
                if directive.is_empty() {
                    return None;
                }
                Some((entry.id.trim().to_lowercase(), directive.to_string()))
            })
            .collect()
    }

    /// agent id（小写）-> 允许派生的目标 agent（小写）
    pub fn allow_agents(&self) -> HashMap<String, Vec<String>> {
        self.agents
            .list
            .iter()
            .filter(|entry| !entry.allow_agents.is_empty())
            .map(|entry| {
                let targets = entry
                    .allow_agents
                    .iter()
                    .map(|target| target.trim().to_lowercase())
                    .filter(|target| !target.is_empty())
                    .collect();
                (entry.id.trim().to_lowercase(), targets)
            })
            .collect()
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.archive_after_ms(), Some(60 * 60_000));
        assert_eq!(cfg.agent_timeout_ms(), 600_000);
        assert_eq!(cfg.agents.defaults.subagents.max_retries, 0);
        assert_eq!(cfg.registry.sweep_interval_secs, 60);
        assert_eq!(cfg.agents.defaults.subagents.max_children_per_agent, 5);
        assert_eq!(cfg.gateway.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_huge_archive_ttl_saturates() {
        let mut cfg = AppConfig::default();
        cfg.agents.defaults.subagents.archive_after_minutes = u64::MAX;
        assert_eq!(cfg.archive_after_ms(), Some(i64::MAX));

        cfg.agents.defaults.subagents.archive_after_minutes = 1 << 50;
        assert_eq!(cfg.archive_after_ms(), Some(i64::MAX));
    }

    #[test]
    fn test_archive_disabled_with_zero() {
        let mut cfg = AppConfig::default();
        cfg.agents.defaults.subagents.archive_after_minutes = 0;
        assert_eq!(cfg.archive_after_ms(), None);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bee.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
url = "ws://gateway.local:9000"
request_timeout_secs = 3

[agents.defaults]
timeout_seconds = 120

[agents.defaults.subagents]
archive_after_minutes = 5
max_retries = 2
max_children_per_agent = 2

[[agents.list]]
id = "Research"
task_directive = "  Cite every source.  "
allow_agents = ["Writer", " "]

[[agents.list]]
id = "writer"
task_directive = "   "
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.gateway.url, "ws://gateway.local:9000");
        assert_eq!(cfg.agent_timeout_ms(), 120_000);
        assert_eq!(cfg.archive_after_ms(), Some(5 * 60_000));
        assert_eq!(cfg.agents.defaults.subagents.max_retries, 2);
        assert_eq!(cfg.agents.defaults.subagents.max_children_per_agent, 2);
        assert_eq!(cfg.gateway.request_timeout(), Duration::from_secs(3));

        let directives = cfg.task_directives();
        assert_eq!(directives.get("research").map(String::as_str), Some("Cite every source."));
        assert!(!directives.contains_key("writer"));

        let allow = cfg.allow_agents();
        assert_eq!(allow.get("research"), Some(&vec!["writer".to_string()]));
        assert!(!allow.contains_key("writer"));
    }
}
