//! 会话 key 解析
//!
//! 子会话 key 形如 `agent:<agentId>:subagent:<uuid>`。

pub const DEFAULT_AGENT_ID: &str = "main";

/// 从会话 key 中取 agent id（小写）；不是 `agent:` 前缀时回退到 main
pub fn resolve_agent_id(session_key: &str) -> String {
    let mut parts = session_key.trim().splitn(3, ':');
    match (parts.next(), parts.next()) {
        (Some(prefix), Some(id)) if prefix.eq_ignore_ascii_case("agent") && !id.trim().is_empty() => {
            id.trim().to_lowercase()
        }
        _ => DEFAULT_AGENT_ID.to_string(),
    }
}

/// 为 agent 生成新的子会话 key
pub fn new_subagent_session_key(agent_id: &str) -> String {
    format!("agent:{}:subagent:{}", agent_id, uuid::Uuid::new_v4())
}
