//! Relay Configuration
//!
//! Configuration is resolved once at process start into an immutable
//! [`RelayConfig`] which is then shared (as `Arc<RelayConfig>`) with the
//! publisher, the subscription manager and the fan-in multiplexer. Nothing in
//! the core reads the environment on its own after that.
//!
//! # Configuration Priority
//!
//! Values are layered with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! The configuration file lives at `$XDG_CONFIG_HOME/relay/config.toml`.
//!
//! # Example Configuration
//!
//! ```toml
//! [broker]
//! brokers = ["kafka-1:9092", "kafka-2:9092"]
//! topic = "messages"
//! username = "relay"
//! password = "secret"
//!
//! [publish]
//! max_attempts = 10
//! write_timeout_ms = 10000
//! backoff_min_ms = 100
//! backoff_max_ms = 1000
//! mode = "sync"
//!
//! [subscribe]
//! resubscribe_on_topology_change = true
//!
//! [server]
//! listen = "127.0.0.1:8080"
//! user_header = "x-relay-user"
//! partitions = 4
//! max_connections = 1024
//! handshake_timeout_ms = 10000
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `RELAY_BROKERS` / `KAFKA_BROKER` | comma separated broker addresses |
//! | `RELAY_TOPIC` / `KAFKA_TOPIC` | topic carrying envelopes |
//! | `RELAY_USERNAME` / `KAFKA_USERNAME` | SASL username |
//! | `RELAY_PASSWORD` / `KAFKA_PASSWORD` | SASL password |
//! | `RELAY_PUBLISH_ATTEMPTS` | publish retry budget |
//! | `RELAY_PUBLISH_MODE` | `sync` or `async` |
//! | `RELAY_LISTEN` | daemon listen address |
//! | `RELAY_PARTITIONS` | embedded broker partition count |

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::publisher::PublishMode;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the highest-priority configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    Cli,
    Env,
    File,
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// SASL mechanism used when credentials are configured
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
    ScramSha256,
}

/// Broker authentication credentials
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
    pub mechanism: SaslMechanism,
}

impl BrokerCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            mechanism: SaslMechanism::ScramSha256,
        }
    }

    /// Credentials are only used when both parts are non-empty
    fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Self::new(u, p)),
            _ => None,
        }
    }
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// Broker connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub credentials: Option<BrokerCredentials>,
    /// TLS is forced on whenever credentials are present
    pub tls: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topic: "messages".to_string(),
            credentials: None,
            tls: false,
        }
    }
}

impl BrokerConfig {
    fn set_credentials(&mut self, username: Option<&str>, password: Option<&str>) {
        self.credentials = BrokerCredentials::from_parts(username, password);
        if self.credentials.is_some() {
            self.tls = true;
        }
    }
}

/// Publish path settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishConfig {
    /// Attempts per publish call, including the first
    pub max_attempts: u32,
    /// Timeout for a single attempt
    pub write_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Mode used by callers that do not pick one explicitly
    pub default_mode: PublishMode,
    /// Pending requests per publisher session
    pub queue_depth: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            write_timeout: Duration::from_secs(10),
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            default_mode: PublishMode::Sync,
            queue_depth: 64,
        }
    }
}

impl PublishConfig {
    /// Backoff before retry number `attempt` (1-based), doubling up to the cap
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff_min
            .saturating_mul(1u32 << shift)
            .min(self.backoff_max)
    }
}

/// Subscribe path settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeConfig {
    pub resubscribe_on_topology_change: bool,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            resubscribe_on_topology_change: true,
        }
    }
}

/// Embedded daemon settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: String,
    /// Handshake header carrying the authenticated user id
    pub user_header: String,
    /// Partition count of the embedded broker topic
    pub partitions: usize,
    /// Optional membership fixture for the embedded record store
    pub seed: Option<PathBuf>,
    /// Accepted sockets counted against the limit, handshaking or not
    pub max_connections: usize,
    /// Time a client gets to finish the WebSocket handshake
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            user_header: "x-relay-user".to_string(),
            partitions: 4,
            seed: None,
            max_connections: 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Fully resolved relay configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub publish: PublishConfig,
    pub subscribe: SubscribeConfig,
    pub server: ServerConfig,
    config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            publish: PublishConfig::default(),
            subscribe: SubscribeConfig::default(),
            server: ServerConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    #[must_use]
    pub fn config_file_path(&self) -> Option<&PathBuf> {
        self.config_file_path.as_ref()
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "at least one broker address is required".to_string(),
            ));
        }
        if self.broker.topic.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "broker topic must not be empty".to_string(),
            ));
        }
        if self.publish.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "publish.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.publish.backoff_min > self.publish.backoff_max {
            return Err(ConfigError::ValidationError(format!(
                "publish.backoff_min_ms ({:?}) exceeds publish.backoff_max_ms ({:?})",
                self.publish.backoff_min, self.publish.backoff_max
            )));
        }
        if self.publish.queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "publish.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.server.partitions == 0 {
            return Err(ConfigError::ValidationError(
                "server.partitions must be at least 1".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_connections must be at least 1".to_string(),
            ));
        }
        if self.server.handshake_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "server.handshake_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerToml {
    pub brokers: Option<Vec<String>>,
    pub topic: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishToml {
    pub max_attempts: Option<u32>,
    pub write_timeout_ms: Option<u64>,
    pub backoff_min_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub mode: Option<PublishMode>,
    pub queue_depth: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeToml {
    pub resubscribe_on_topology_change: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    pub listen: Option<String>,
    pub user_header: Option<String>,
    pub partitions: Option<usize>,
    pub seed: Option<PathBuf>,
    pub max_connections: Option<usize>,
    pub handshake_timeout_ms: Option<u64>,
}

/// Root of the TOML configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    pub broker: BrokerToml,
    pub publish: PublishToml,
    pub subscribe: SubscribeToml,
    pub server: ServerToml,
}

// =============================================================================
// Loading
// =============================================================================

/// `$XDG_CONFIG_HOME/relay/config.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("config.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// resulting configuration is invalid. A missing file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific file path, then the environment
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;
            let toml_config: RelayToml = toml::from_str(&content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Apply TOML values on top of the current configuration
pub fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    if let Some(ref brokers) = toml.broker.brokers {
        config.broker.brokers = brokers.clone();
    }
    if let Some(ref topic) = toml.broker.topic {
        config.broker.topic = topic.clone();
    }
    if let Some(tls) = toml.broker.tls {
        config.broker.tls = tls;
    }
    if toml.broker.username.is_some() || toml.broker.password.is_some() {
        config
            .broker
            .set_credentials(toml.broker.username.as_deref(), toml.broker.password.as_deref());
    }

    if let Some(attempts) = toml.publish.max_attempts {
        config.publish.max_attempts = attempts;
    }
    if let Some(ms) = toml.publish.write_timeout_ms {
        config.publish.write_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.publish.backoff_min_ms {
        config.publish.backoff_min = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.publish.backoff_max_ms {
        config.publish.backoff_max = Duration::from_millis(ms);
    }
    if let Some(mode) = toml.publish.mode {
        config.publish.default_mode = mode;
    }
    if let Some(depth) = toml.publish.queue_depth {
        config.publish.queue_depth = depth;
    }

    if let Some(resubscribe) = toml.subscribe.resubscribe_on_topology_change {
        config.subscribe.resubscribe_on_topology_change = resubscribe;
    }

    if let Some(ref listen) = toml.server.listen {
        config.server.listen = listen.clone();
    }
    if let Some(ref header) = toml.server.user_header {
        config.server.user_header = header.clone();
    }
    if let Some(partitions) = toml.server.partitions {
        config.server.partitions = partitions;
    }
    if toml.server.seed.is_some() {
        config.server.seed = toml.server.seed.clone();
    }
    if let Some(max) = toml.server.max_connections {
        config.server.max_connections = max;
    }
    if let Some(ms) = toml.server.handshake_timeout_ms {
        config.server.handshake_timeout = Duration::from_millis(ms);
    }
}

/// Apply environment overrides, reading variables through `lookup`
///
/// `RELAY_*` variables win over their `KAFKA_*` counterparts.
pub fn apply_env_config<F>(config: &mut RelayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |primary: &str, fallback: Option<&str>| {
        lookup(primary)
            .or_else(|| fallback.and_then(&lookup))
            .filter(|v| !v.is_empty())
    };

    if let Some(brokers) = var("RELAY_BROKERS", Some("KAFKA_BROKER")) {
        config.broker.brokers = brokers
            .split(',')
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
        config.source = ConfigSource::Env;
    }
    if let Some(topic) = var("RELAY_TOPIC", Some("KAFKA_TOPIC")) {
        config.broker.topic = topic;
        config.source = ConfigSource::Env;
    }

    let username = var("RELAY_USERNAME", Some("KAFKA_USERNAME"));
    let password = var("RELAY_PASSWORD", Some("KAFKA_PASSWORD"));
    if username.is_some() || password.is_some() {
        config
            .broker
            .set_credentials(username.as_deref(), password.as_deref());
        config.source = ConfigSource::Env;
    }

    if let Some(attempts) = var("RELAY_PUBLISH_ATTEMPTS", None).and_then(|v| v.parse().ok()) {
        config.publish.max_attempts = attempts;
        config.source = ConfigSource::Env;
    }
    if let Some(mode) = var("RELAY_PUBLISH_MODE", None).and_then(|v| v.parse().ok()) {
        config.publish.default_mode = mode;
        config.source = ConfigSource::Env;
    }
    if let Some(listen) = var("RELAY_LISTEN", None) {
        config.server.listen = listen;
        config.source = ConfigSource::Env;
    }
    if let Some(partitions) = var("RELAY_PARTITIONS", None).and_then(|v| v.parse().ok()) {
        config.server.partitions = partitions;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Highest-priority overrides, typically built from command-line arguments
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub brokers: Option<Vec<String>>,
    pub topic: Option<String>,
    pub listen: Option<String>,
    pub partitions: Option<usize>,
    pub seed: Option<PathBuf>,
    pub publish_mode: Option<PublishMode>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_brokers(mut self, brokers: Vec<String>) -> Self {
        self.brokers = Some(brokers);
        self
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = Some(listen.into());
        self
    }

    #[must_use]
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = Some(partitions);
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: PathBuf) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_publish_mode(mut self, mode: PublishMode) -> Self {
        self.publish_mode = Some(mode);
        self
    }

    /// Apply the overrides and re-validate
    pub fn apply(&self, config: &mut RelayConfig) -> Result<(), ConfigError> {
        let mut touched = false;
        if let Some(ref brokers) = self.brokers {
            config.broker.brokers = brokers.clone();
            touched = true;
        }
        if let Some(ref topic) = self.topic {
            config.broker.topic = topic.clone();
            touched = true;
        }
        if let Some(ref listen) = self.listen {
            config.server.listen = listen.clone();
            touched = true;
        }
        if let Some(partitions) = self.partitions {
            config.server.partitions = partitions;
            touched = true;
        }
        if let Some(ref seed) = self.seed {
            config.server.seed = Some(seed.clone());
            touched = true;
        }
        if let Some(mode) = self.publish_mode {
            config.publish.default_mode = mode;
            touched = true;
        }
        if touched {
            config.source = ConfigSource::Cli;
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert_eq!(config.broker.topic, "messages");
        assert_eq!(config.publish.max_attempts, 10);
        assert_eq!(config.publish.write_timeout, Duration::from_secs(10));
        assert_eq!(config.publish.default_mode, PublishMode::Sync);
        assert!(config.subscribe.resubscribe_on_topology_change);
        assert!(config.broker.credentials.is_none());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("relay/config.toml"));
        }
    }

    #[test]
    fn test_parse_valid_toml() {
        let file = write_toml(
            r#"
[broker]
brokers = ["a:9092", "b:9092"]
topic = "chat"
username = "relay"
password = "secret"

[publish]
max_attempts = 3
write_timeout_ms = 500
backoff_min_ms = 1
backoff_max_ms = 4
mode = "async"

[subscribe]
resubscribe_on_topology_change = false

[server]
listen = "0.0.0.0:9000"
partitions = 8
max_connections = 16
handshake_timeout_ms = 250
"#,
        );

        let mut config = RelayConfig::default();
        let toml: RelayToml =
            toml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        apply_toml_config(&mut config, &toml);

        assert_eq!(config.broker.brokers, vec!["a:9092", "b:9092"]);
        assert_eq!(config.broker.topic, "chat");
        assert_eq!(
            config.broker.credentials,
            Some(BrokerCredentials::new("relay", "secret"))
        );
        assert!(config.broker.tls);
        assert_eq!(config.publish.max_attempts, 3);
        assert_eq!(config.publish.write_timeout, Duration::from_millis(500));
        assert_eq!(config.publish.default_mode, PublishMode::Async);
        assert!(!config.subscribe.resubscribe_on_topology_change);
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.partitions, 8);
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(config.server.handshake_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_load_from_path_marks_file_source() {
        let file = write_toml("[broker]\ntopic = \"from-file\"\n");
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        // RELAY_TOPIC / KAFKA_TOPIC may be set in the environment running the tests
        if std::env::var("RELAY_TOPIC").is_err() && std::env::var("KAFKA_TOPIC").is_err() {
            assert_eq!(config.broker.topic, "from-file");
        }
        assert_eq!(config.config_file_path(), Some(&file.path().to_path_buf()));
    }

    #[test]
    fn test_missing_file_graceful() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/relay/config.toml"))).unwrap();
        assert!(config.config_file_path().is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_toml("[broker\ntopic = ");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = RelayConfig::default();
        let toml: RelayToml = toml::from_str("[broker]\ntopic = \"file-topic\"").unwrap();
        apply_toml_config(&mut config, &toml);

        apply_env_config(
            &mut config,
            env(&[
                ("KAFKA_BROKER", "k1:9092, k2:9092"),
                ("KAFKA_TOPIC", "kafka-topic"),
                ("RELAY_TOPIC", "relay-topic"),
            ]),
        );

        assert_eq!(config.broker.brokers, vec!["k1:9092", "k2:9092"]);
        assert_eq!(config.broker.topic, "relay-topic");
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_credentials_require_both_parts() {
        let mut config = RelayConfig::default();
        apply_env_config(&mut config, env(&[("KAFKA_USERNAME", "relay")]));
        assert!(config.broker.credentials.is_none());
        assert!(!config.broker.tls);

        apply_env_config(
            &mut config,
            env(&[("KAFKA_USERNAME", "relay"), ("KAFKA_PASSWORD", "pw")]),
        );
        let creds = config.broker.credentials.clone().unwrap();
        assert_eq!(creds.mechanism, SaslMechanism::ScramSha256);
        assert!(config.broker.tls);
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = BrokerCredentials::new("relay", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("relay"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = RelayConfig::default();
        apply_env_config(&mut config, env(&[("RELAY_TOPIC", "env-topic")]));

        ConfigOverrides::new()
            .with_topic("cli-topic")
            .with_partitions(12)
            .with_publish_mode(PublishMode::Async)
            .apply(&mut config)
            .unwrap();

        assert_eq!(config.broker.topic, "cli-topic");
        assert_eq!(config.server.partitions, 12);
        assert_eq!(config.publish.default_mode, PublishMode::Async);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_no_change() {
        let mut config = RelayConfig::default();
        ConfigOverrides::new().apply(&mut config).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = RelayConfig::default();
        config.publish.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = RelayConfig::default();
        config.broker.brokers = vec![" ".to_string()];
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.publish.backoff_min = Duration::from_secs(5);
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.server.handshake_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.server.max_connections = 0;
        assert!(config.validate().is_err());

        let result = ConfigOverrides::new()
            .with_partitions(0)
            .apply(&mut RelayConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let publish = PublishConfig::default();
        assert_eq!(publish.backoff(1), Duration::from_millis(100));
        assert_eq!(publish.backoff(2), Duration::from_millis(200));
        assert_eq!(publish.backoff(4), Duration::from_millis(800));
        assert_eq!(publish.backoff(5), Duration::from_secs(1));
        assert_eq!(publish.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
