//! Configuration system for the node agent
//!
//! Settings are loaded from a TOML file with one section per component:
//! `[agent]`, `[platform]`, `[platform.tls]`, `[engine]`, `[store]`,
//! `[heartbeat]`, `[metrics]`. Secrets (the platform bearer token) are
//! referenced by environment-variable name and resolved at runtime.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSettings {
    pub agent: AgentSection,
    pub platform: PlatformSection,
    pub engine: EngineSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

/// Agent identity section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Agent identifier (must match [a-zA-Z0-9._-]+); generated when absent
    #[serde(default)]
    pub id: Option<String>,
}

/// Platform connection section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformSection {
    /// Platform base URL (http:// or https://)
    pub base_url: String,
    /// Environment variable containing the bearer token
    pub token_env: Option<String>,
    /// Whether to maintain the persistent control channel (default: true)
    #[serde(default = "default_true")]
    pub control_channel: bool,
    /// Control-channel ping interval in seconds (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Delay between control-channel reconnection attempts (default: 5)
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Maximum reconnection attempts; 0 means retry forever (default: 0)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    /// Upper bound on any single HTTP request (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Optional TLS settings; presence enables TLS
    pub tls: Option<TlsSection>,
}

/// TLS section; a client keypair is mandatory when the section is present
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    /// Client certificate in PEM format
    pub cert_path: PathBuf,
    /// Client private key in PEM format
    pub key_path: PathBuf,
    /// Optional CA bundle; platform roots are used otherwise
    pub ca_path: Option<PathBuf>,
    /// Skip server certificate verification (discouraged)
    #[serde(default)]
    pub skip_verify: bool,
}

/// Engine supervision section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSection {
    /// Path to the engine binary
    pub binary_path: PathBuf,
    /// Directory holding pipeline configuration files
    pub config_dir: PathBuf,
    /// Engine data directory
    pub data_dir: PathBuf,
    /// Engine log directory
    pub log_dir: PathBuf,
    /// Pipeline worker count (>= 1 when set)
    pub workers: Option<u32>,
    /// Pipeline batch size (>= 1 when set)
    pub batch_size: Option<u32>,
    /// Pass the engine's automatic-reload flags and send SIGHUP on apply
    #[serde(default = "default_true")]
    pub auto_reload: bool,
    /// Grace period after spawn before the engine counts as running
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,
    /// Hard deadline on the whole start operation
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

/// Configuration store section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    /// Number of backups retained per config id (default: 3)
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backup_count: default_backup_count(),
        }
    }
}

/// Heartbeat section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatSection {
    /// Heartbeat interval in seconds (values below 10 are clamped)
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Metrics section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSection {
    /// Metrics sampling interval in seconds (values below 30 are clamped)
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ping_interval() -> u64 {
    30
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_startup_grace() -> u64 {
    5
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_backup_count() -> usize {
    3
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_metrics_interval() -> u64 {
    60
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentSettings {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentSettings = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints after parse
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.agent.id {
            validate_agent_id(id)?;
        }

        let url = url::Url::parse(&self.platform.base_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "platform.base_url '{}' is not a valid URL: {e}",
                self.platform.base_url
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "platform.base_url scheme must be http or https, got '{}'",
                url.scheme()
            )));
        }

        if let Some(workers) = self.engine.workers {
            if workers == 0 {
                return Err(ConfigError::InvalidConfig(
                    "engine.workers must be >= 1".to_string(),
                ));
            }
        }
        if let Some(batch) = self.engine.batch_size {
            if batch == 0 {
                return Err(ConfigError::InvalidConfig(
                    "engine.batch_size must be >= 1".to_string(),
                ));
            }
        }
        if self.store.backup_count == 0 {
            return Err(ConfigError::InvalidConfig(
                "store.backup_count must be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Agent id from the file, or a generated `agent-<uuid>` fallback
    pub fn resolve_agent_id(&self) -> String {
        match &self.agent.id {
            Some(id) => id.clone(),
            None => format!("agent-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Bearer token from the configured environment variable, if any
    pub fn platform_token(&self) -> Result<Option<String>, ConfigError> {
        match &self.platform.token_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_settings() -> Self {
        let toml_content = r#"
[agent]
id = "test-agent"

[platform]
base_url = "http://localhost:8080"

[engine]
binary_path = "/usr/share/logstash/bin/logstash"
config_dir = "/etc/logstash/conf.d"
data_dir = "/var/lib/logstash"
log_dir = "/var/log/logstash"
"#;
        toml::from_str(toml_content).expect("Test settings should parse")
    }
}

/// Validate agent ID format
fn validate_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    let valid_chars = agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if agent_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidAgentId(format!(
            "Agent ID '{agent_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[agent]
id = "node-7"

[platform]
base_url = "https://platform.example.com:8443"
token_env = "PLATFORM_TOKEN"
control_channel = true
ping_interval_secs = 15
reconnect_interval_secs = 10
max_reconnect_attempts = 5
request_timeout_secs = 20

[platform.tls]
cert_path = "/etc/pipeagent/client.crt"
key_path = "/etc/pipeagent/client.key"
ca_path = "/etc/pipeagent/ca.pem"

[engine]
binary_path = "/usr/share/logstash/bin/logstash"
config_dir = "/etc/logstash/conf.d"
data_dir = "/var/lib/logstash"
log_dir = "/var/log/logstash"
workers = 4
batch_size = 250
auto_reload = true

[store]
backup_count = 5

[heartbeat]
interval_secs = 30

[metrics]
interval_secs = 60
"#;

        let config: AgentSettings = toml::from_str(toml_content).unwrap();
        config.validate().unwrap();
        assert_eq!(config.agent.id.as_deref(), Some("node-7"));
        assert_eq!(config.platform.ping_interval_secs, 15);
        assert_eq!(config.platform.max_reconnect_attempts, 5);
        assert_eq!(config.engine.workers, Some(4));
        assert_eq!(config.store.backup_count, 5);
        let tls = config.platform.tls.unwrap();
        assert_eq!(
            tls.ca_path.as_deref(),
            Some(Path::new("/etc/pipeagent/ca.pem"))
        );
        assert!(!tls.skip_verify);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = AgentSettings::test_settings();
        config.validate().unwrap();
        assert!(config.platform.control_channel);
        assert_eq!(config.platform.ping_interval_secs, 30);
        assert_eq!(config.platform.reconnect_interval_secs, 5);
        assert_eq!(config.platform.max_reconnect_attempts, 0);
        assert_eq!(config.store.backup_count, 3);
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.metrics.interval_secs, 60);
        assert!(config.engine.auto_reload);
        assert_eq!(config.engine.startup_grace_secs, 5);
        assert_eq!(config.engine.startup_timeout_secs, 60);
    }

    #[test]
    fn test_invalid_agent_id() {
        let result = validate_agent_id("invalid@agent");
        assert!(result.is_err());

        let result = validate_agent_id("valid-agent_123.test");
        assert!(result.is_ok());
    }

    #[test]
    fn test_generated_agent_id() {
        let mut config = AgentSettings::test_settings();
        config.agent.id = None;
        let id = config.resolve_agent_id();
        assert!(id.starts_with("agent-"));
        assert!(id.len() > "agent-".len());
    }

    #[test]
    fn test_rejects_bad_base_url_scheme() {
        let mut config = AgentSettings::test_settings();
        config.platform.base_url = "ftp://host:21".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = AgentSettings::test_settings();
        config.engine.workers = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_backup_count() {
        let mut config = AgentSettings::test_settings();
        config.store.backup_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_env_missing_is_error() {
        let mut config = AgentSettings::test_settings();
        config.platform.token_env = Some("PIPEAGENT_TEST_NO_SUCH_VAR".to_string());
        assert!(matches!(
            config.platform_token(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }
}
