//! Configuration system for the BMS monitor
//!
//! Broker endpoints, topic names, reconnection timings, command rate limits
//! and telemetry bounds are all read from a single TOML file. Credentials are
//! never stored in the file; it names the environment variables that hold them.

use crate::protocol::validate_topic_name;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main monitor configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// One candidate broker endpoint, tried in configuration order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerEndpoint {
    /// Human readable label used in logs and notifications
    pub name: String,
    /// Broker URI (`mqtt://`, `mqtts://`, `ws://` or `wss://`)
    pub address: String,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Ordered fallback list; the first entry is the primary endpoint
    pub endpoints: Vec<BrokerEndpoint>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// MQTT keep-alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Transport-level connect timeout in seconds (default: 20)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    20
}

/// Topic names shared with the device firmware
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    #[serde(default = "default_data_topic")]
    pub data: String,
    #[serde(default = "default_status_topic")]
    pub status: String,
    #[serde(default = "default_control_topic")]
    pub control: String,
}

fn default_data_topic() -> String {
    "bms/data".to_string()
}

fn default_status_topic() -> String {
    "bms/status".to_string()
}

fn default_control_topic() -> String {
    "bms/control".to_string()
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            data: default_data_topic(),
            status: default_status_topic(),
            control: default_control_topic(),
        }
    }
}

impl TopicsSection {
    /// Topics subscribed to after every successful connect
    pub fn inbound(&self) -> Vec<String> {
        vec![self.data.clone(), self.status.clone()]
    }
}

/// Reconnection timings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Time allowed for a ConnAck before the attempt is abandoned
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Delay before retrying after an abandoned attempt
    #[serde(default = "default_timeout_retry_delay_ms")]
    pub timeout_retry_delay_ms: u64,
    /// Delay before retrying after a transport-reported ConnAck timeout
    #[serde(default = "default_ack_timeout_retry_delay_ms")]
    pub ack_timeout_retry_delay_ms: u64,
    /// First backoff step after a setup failure
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Ceiling for setup-failure backoff
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Largest doubling exponent applied to the base delay
    #[serde(default = "default_backoff_max_exponent")]
    pub backoff_max_exponent: u32,
    /// Period of the background health check
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

fn default_attempt_timeout_ms() -> u64 {
    25_000
}

fn default_timeout_retry_delay_ms() -> u64 {
    2_000
}

fn default_ack_timeout_retry_delay_ms() -> u64 {
    3_000
}

fn default_backoff_base_ms() -> u64 {
    3_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_max_exponent() -> u32 {
    3
}

fn default_health_check_interval() -> u64 {
    45
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            timeout_retry_delay_ms: default_timeout_retry_delay_ms(),
            ack_timeout_retry_delay_ms: default_ack_timeout_retry_delay_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_max_exponent: default_backoff_max_exponent(),
            health_check_interval_secs: default_health_check_interval(),
        }
    }
}

impl ReconnectSection {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Outbound command settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandsSection {
    /// Minimum spacing between two published commands
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

fn default_min_interval_ms() -> u64 {
    1_000
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

/// Inbound telemetry bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    /// Payloads larger than this are dropped unparsed
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Age after which consumers should treat telemetry as stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_max_payload_bytes() -> usize {
    2048
}

fn default_stale_after_secs() -> u64 {
    10
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl TelemetrySection {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Names of the environment variables holding broker credentials
///
/// Resolved on every connect attempt, so rotated secrets are picked up
/// without rebuilding the link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSource {
    pub username_env: Option<String>,
    pub password_env: Option<String>,
}

impl CredentialSource {
    /// Read the variables now; `None` when no username variable is configured or set
    pub fn resolve(&self) -> Option<Credentials> {
        let username = read_env(self.username_env.as_deref())?;
        Some(Credentials {
            username,
            password: read_env(self.password_env.as_deref()).unwrap_or_default(),
        })
    }
}

fn read_env(name: Option<&str>) -> Option<String> {
    name.and_then(|name| std::env::var(name).ok())
}

/// Broker credentials read from the environment
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid endpoint '{name}': {reason}")]
    InvalidEndpoint { name: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MonitorConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.endpoints.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[broker] requires at least one [[broker.endpoints]] entry".to_string(),
            ));
        }

        for endpoint in &self.broker.endpoints {
            validate_endpoint(endpoint)?;
        }

        for (label, topic) in [
            ("data", &self.topics.data),
            ("status", &self.topics.status),
            ("control", &self.topics.control),
        ] {
            validate_topic_name(topic).map_err(|e| {
                ConfigError::InvalidConfig(format!("topics.{label} is invalid: {e}"))
            })?;
        }

        if self.commands.min_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "commands.min_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.health_check_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.health_check_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.backoff_base_ms > self.reconnect.backoff_max_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.backoff_base_ms cannot exceed reconnect.backoff_max_ms".to_string(),
            ));
        }

        Ok(())
    }

    /// Where broker credentials come from
    pub fn credential_source(&self) -> CredentialSource {
        CredentialSource {
            username_env: self.broker.username_env.clone(),
            password_env: self.broker.password_env.clone(),
        }
    }

    /// Resolve credentials from the environment as it is right now
    pub fn credentials(&self) -> Option<Credentials> {
        self.credential_source().resolve()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]

[[broker.endpoints]]
name = "Primary"
address = "mqtt://localhost:1883"

[[broker.endpoints]]
name = "Secondary"
address = "ws://localhost:8080/mqtt"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn validate_endpoint(endpoint: &BrokerEndpoint) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidEndpoint {
        name: endpoint.name.clone(),
        reason,
    };

    let url = Url::parse(&endpoint.address).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "mqtt" | "mqtts" | "tcp" | "ssl" | "ws" | "wss" => {}
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
username_env = "BMS_MQTT_USERNAME"
password_env = "BMS_MQTT_PASSWORD"
keep_alive_secs = 30
connect_timeout_secs = 10

[[broker.endpoints]]
name = "Primary WebSocket"
address = "wss://broker.example.com:8884/mqtt"

[[broker.endpoints]]
name = "Alternative WebSocket"
address = "wss://broker.example.com:8884/"

[topics]
data = "pack/data"
status = "pack/status"
control = "pack/control"

[reconnect]
attempt_timeout_ms = 15000
health_check_interval_secs = 30

[commands]
min_interval_ms = 500

[telemetry]
max_payload_bytes = 4096
stale_after_secs = 20
"#;

        let config = MonitorConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.broker.endpoints.len(), 2);
        assert_eq!(config.broker.endpoints[1].name, "Alternative WebSocket");
        assert_eq!(config.broker.keep_alive_secs, 30);
        assert_eq!(config.topics.control, "pack/control");
        assert_eq!(config.reconnect.attempt_timeout(), Duration::from_secs(15));
        // Unspecified reconnect fields keep their defaults
        assert_eq!(config.reconnect.timeout_retry_delay_ms, 2_000);
        assert_eq!(config.commands.min_interval_ms, 500);
        assert_eq!(config.telemetry.max_payload_bytes, 4096);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = MonitorConfig::test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert_eq!(config.broker.connect_timeout_secs, 20);
        assert_eq!(config.topics, TopicsSection::default());
        assert_eq!(config.topics.inbound(), vec!["bms/data", "bms/status"]);
        assert_eq!(config.reconnect, ReconnectSection::default());
        assert_eq!(config.reconnect.health_check_interval(), Duration::from_secs(45));
        assert_eq!(config.commands.min_interval_ms, 1_000);
        assert_eq!(config.telemetry.max_payload_bytes, 2048);
        assert_eq!(config.telemetry.stale_after(), Duration::from_secs(10));
    }

    #[test]
    fn test_empty_endpoint_list_rejected() {
        let result = MonitorConfig::from_toml_str("[broker]\nendpoints = []\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let toml_content = r#"
[broker]

[[broker.endpoints]]
name = "Web"
address = "http://broker.example.com"
"#;
        let result = MonitorConfig::from_toml_str(toml_content);
        match result {
            Err(ConfigError::InvalidEndpoint { name, reason }) => {
                assert_eq!(name, "Web");
                assert!(reason.contains("http"));
            }
            other => panic!("Expected InvalidEndpoint, got {other:?}"),
        }
    }

    #[test]
    fn test_wildcard_topic_rejected() {
        let mut config = MonitorConfig::test_config();
        config.topics.control = "bms/#".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let mut config = MonitorConfig::test_config();
        config.commands.min_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_absent_without_env_names() {
        let config = MonitorConfig::test_config();
        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            username: "dashboard".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("dashboard"));
        assert!(!rendered.contains("hunter2"));
    }
}
