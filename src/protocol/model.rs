//! Shared data model for the node agent
//!
//! These structures appear in HTTP request bodies and control-frame
//! payloads. Pipeline configuration content is treated as an opaque blob
//! identified by (id, version); the agent never inspects it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Node identity reported to the platform at registration
///
/// Immutable after startup except for `engine_version`, which is filled in
/// once the supervisor has started the engine and detected its version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub hostname: String,
    /// Primary non-loopback IPv4 address
    pub ip: String,
    /// Engine version string; "unknown" until the supervisor reports one
    #[serde(rename = "logstash_version")]
    pub engine_version: String,
}

/// Agent availability state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatusState {
    Offline,
    Online,
}

/// Live status document for one agent
///
/// The applied list is a set keyed by config id: a newer version for the
/// same id replaces the prior entry in place, preserving position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStatus {
    pub agent_id: String,
    pub status: AgentStatusState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub applied_configs: Vec<AppliedConfig>,
}

impl AgentStatus {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: AgentStatusState::Offline,
            last_heartbeat: None,
            applied_configs: Vec::new(),
        }
    }

    /// Insert or replace the applied record for `entry.config_id`,
    /// preserving the original position on replace
    pub fn upsert_applied(&mut self, entry: AppliedConfig) {
        match self
            .applied_configs
            .iter_mut()
            .find(|a| a.config_id == entry.config_id)
        {
            Some(existing) => *existing = entry,
            None => self.applied_configs.push(entry),
        }
    }

    /// Remove the applied record for `config_id`; missing id is a no-op
    pub fn remove_applied(&mut self, config_id: &str) {
        self.applied_configs.retain(|a| a.config_id != config_id);
    }
}

/// A (config id, version) pair the agent has successfully applied
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedConfig {
    pub config_id: String,
    pub version: u64,
    pub applied_at: DateTime<Utc>,
}

/// Pipeline configuration fetched from the platform
///
/// Identity is (id, version); `content` is an opaque UTF-8 blob and `name`
/// is display-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub id: String,
    pub version: u64,
    pub content: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Snapshot of the supervised engine process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineStatus {
    pub running: bool,
    /// Process id; 0 exactly when not running
    pub pid: u32,
    pub version: String,
    pub config_dir: PathBuf,
    pub start_time: Option<DateTime<Utc>>,
    pub last_reload_time: Option<DateTime<Utc>>,
}

impl EngineStatus {
    pub fn stopped(config_dir: PathBuf) -> Self {
        Self {
            running: false,
            pid: 0,
            version: "unknown".to_string(),
            config_dir,
            start_time: None,
            last_reload_time: None,
        }
    }
}

/// One resource sample reported to the platform
///
/// Snapshot values, never aggregated across samples. Event counters stay
/// at zero while the engine's stats API is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub events_received: u64,
    pub events_sent: u64,
    pub events_failed: u64,
    pub uptime_secs: u64,
}

/// Combined agent + engine snapshot answered to `status_request`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub agent: AgentStatus,
    pub engine: EngineStatus,
}

/// Heartbeat request body posted to the platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRequest {
    /// Unix seconds
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(id: &str, version: u64) -> AppliedConfig {
        AppliedConfig {
            config_id: id.to_string(),
            version,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_appends_new_ids() {
        let mut status = AgentStatus::new("a-1");
        status.upsert_applied(applied("one", 1));
        status.upsert_applied(applied("two", 1));

        assert_eq!(status.applied_configs.len(), 2);
        assert_eq!(status.applied_configs[0].config_id, "one");
        assert_eq!(status.applied_configs[1].config_id, "two");
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut status = AgentStatus::new("a-1");
        status.upsert_applied(applied("one", 1));
        status.upsert_applied(applied("two", 1));
        status.upsert_applied(applied("one", 5));

        assert_eq!(status.applied_configs.len(), 2);
        // Position preserved: "one" stays first
        assert_eq!(status.applied_configs[0].config_id, "one");
        assert_eq!(status.applied_configs[0].version, 5);
        assert_eq!(status.applied_configs[1].config_id, "two");
    }

    #[test]
    fn test_remove_applied_missing_id_is_noop() {
        let mut status = AgentStatus::new("a-1");
        status.upsert_applied(applied("one", 1));
        status.remove_applied("absent");
        assert_eq!(status.applied_configs.len(), 1);

        status.remove_applied("one");
        assert!(status.applied_configs.is_empty());
    }

    #[test]
    fn test_identity_serializes_engine_version_as_logstash_version() {
        let identity = AgentIdentity {
            agent_id: "a-1".to_string(),
            hostname: "h".to_string(),
            ip: "10.0.0.5".to_string(),
            engine_version: "unknown".to_string(),
        };
        let s = serde_json::to_string(&identity).unwrap();
        assert!(s.contains(r#""logstash_version":"unknown""#), "got: {s}");
        assert!(s.contains(r#""agent_id":"a-1""#));
    }

    #[test]
    fn test_engine_status_stopped_has_zero_pid() {
        let status = EngineStatus::stopped(PathBuf::from("/etc/conf.d"));
        assert!(!status.running);
        assert_eq!(status.pid, 0);
        assert_eq!(status.version, "unknown");
        assert!(status.start_time.is_none());
    }

    #[test]
    fn test_pipeline_config_roundtrip_with_optional_name() {
        let raw = r#"{"id":"c","version":7,"content":"input{stdin{}}"}"#;
        let config: PipelineConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.id, "c");
        assert_eq!(config.version, 7);
        assert!(config.name.is_none());
    }

    #[test]
    fn test_status_state_wire_format() {
        assert_eq!(
            serde_json::to_string(&AgentStatusState::Online).unwrap(),
            r#""online""#
        );
        assert_eq!(
            serde_json::to_string(&AgentStatusState::Offline).unwrap(),
            r#""offline""#
        );
    }
}
