//! Configuration types for the secure producer and consumer clients.
//!
//! Configuration is loaded from YAML files and validated before use.
//! Password fields accept `${VAR}` references that are expanded from the
//! environment when the secret is exposed, so secrets never need to live in
//! the file itself.

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Root configuration shared by both client roles.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Kafka cluster connection configuration.
    pub kafka: KafkaConfig,

    /// Credential and trust anchor locations.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Producer settings.
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Consumer settings.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Kafka cluster connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap server addresses (`host:port`).
    pub bootstrap_servers: Vec<String>,

    /// Client id sent in every request header.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Connection timeout in milliseconds, covering TCP connect and TLS handshake.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Interval in seconds for background metadata refresh.
    /// Set to 0 to disable background refresh.
    #[serde(default = "default_metadata_refresh_interval_secs")]
    pub metadata_refresh_interval_secs: u64,

    /// Initial delay before re-bootstrapping after every known broker failed.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Upper bound for the re-bootstrap delay.
    #[serde(default = "default_reconnect_backoff_max_ms")]
    pub reconnect_backoff_max_ms: u64,

    /// Security protocol for broker connections.
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
}

/// Security protocol for Kafka connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    /// Plain TCP. Only meant for local development and tests.
    Plaintext,
    /// Mutually authenticated TLS.
    #[default]
    Ssl,
}

impl SecurityProtocol {
    /// Check if TLS is required for this protocol.
    #[must_use]
    pub fn requires_tls(&self) -> bool {
        matches!(self, Self::Ssl)
    }
}

/// On-disk format of a keystore or truststore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StoreType {
    /// PKCS#12 archive protected by a password.
    #[default]
    Pkcs12,
    /// PEM file(s). A PEM keystore holds the certificate chain and the private key.
    Pem,
}

impl std::str::FromStr for StoreType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PKCS12" | "P12" => Ok(Self::Pkcs12),
            "PEM" => Ok(Self::Pem),
            other => Err(ConfigError::InvalidValue {
                field: "store_type",
                message: format!("unsupported store type '{other}' (expected PKCS12 or PEM)"),
            }),
        }
    }
}

/// Credential (keystore) and trust anchor (truststore) configuration.
///
/// The two locations are independent inputs; neither is derived from the other.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Path to the client's keystore.
    pub keystore_path: PathBuf,

    /// Keystore format.
    #[serde(default)]
    pub keystore_type: StoreType,

    /// Password protecting the keystore.
    #[serde(default)]
    pub keystore_password: Option<SecretString>,

    /// Password protecting the private key inside the keystore, if it differs.
    #[serde(default)]
    pub key_password: Option<SecretString>,

    /// Path to the truststore holding the certificate authorities to trust.
    pub truststore_path: PathBuf,

    /// Truststore format.
    #[serde(default)]
    pub truststore_type: StoreType,

    /// Password protecting the truststore.
    #[serde(default)]
    pub truststore_password: Option<SecretString>,
}

impl TlsConfig {
    /// Keystore password with environment variables expanded.
    #[must_use]
    pub fn keystore_password(&self) -> Option<SecretString> {
        self.keystore_password.as_ref().map(expand_secret)
    }

    /// Private key password with environment variables expanded.
    #[must_use]
    pub fn key_password(&self) -> Option<SecretString> {
        self.key_password.as_ref().map(expand_secret)
    }

    /// Truststore password with environment variables expanded.
    #[must_use]
    pub fn truststore_password(&self) -> Option<SecretString> {
        self.truststore_password.as_ref().map(expand_secret)
    }
}

/// Number of replica acknowledgments the producer waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire and forget; the broker sends no response.
    None,
    /// The partition leader has written the record.
    Leader,
    /// Every in-sync replica has written the record.
    #[default]
    All,
}

impl Acks {
    /// The `acks` value carried in a produce request.
    #[must_use]
    pub fn as_i16(self) -> i16 {
        match self {
            Self::None => 0,
            Self::Leader => 1,
            Self::All => -1,
        }
    }
}

/// Producer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    /// Acknowledgment policy.
    #[serde(default)]
    pub acks: Acks,

    /// Re-send attempts after a retriable failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between retries in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound for the retry delay in milliseconds.
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Broker-side timeout for a produce request in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum encoded size of a single record batch in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    /// Maximum records grouped into one produce request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long `close` waits for in-flight sends before failing them.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

/// Where a consumer starts when its group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    /// The oldest retained record.
    Earliest,
    /// Only records produced after the consumer joined.
    #[default]
    Latest,
}

impl AutoOffsetReset {
    /// Timestamp sentinel understood by ListOffsets.
    #[must_use]
    pub fn list_offsets_timestamp(self) -> i64 {
        match self {
            Self::Earliest => -2,
            Self::Latest => -1,
        }
    }
}

impl std::str::FromStr for AutoOffsetReset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => Err(ConfigError::InvalidValue {
                field: "auto_offset_reset",
                message: format!("'{other}' (expected earliest or latest)"),
            }),
        }
    }
}

/// Consumer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group identity.
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Start position when no committed offset exists.
    #[serde(default)]
    pub auto_offset_reset: AutoOffsetReset,

    /// Commit delivered positions periodically from `poll`.
    #[serde(default = "default_true")]
    pub enable_auto_commit: bool,

    /// Interval between automatic commits in milliseconds.
    #[serde(default = "default_auto_commit_interval_ms")]
    pub auto_commit_interval_ms: u64,

    /// Group session timeout in milliseconds.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Maximum time the coordinator waits for members to rejoin, in milliseconds.
    #[serde(default = "default_rebalance_timeout_ms")]
    pub rebalance_timeout_ms: u64,

    /// Maximum records returned by a single poll.
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,

    /// Maximum time the broker holds a fetch waiting for data, in milliseconds.
    #[serde(default = "default_fetch_max_wait_ms")]
    pub fetch_max_wait_ms: u64,

    /// Maximum bytes returned by a fetch.
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i32,

    /// Ask the broker to create missing topics on subscribe.
    #[serde(default = "default_true")]
    pub allow_auto_create_topics: bool,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
pub fn expand_env_vars(s: &str) -> String {
    env_var_pattern()
        .replace_all(s, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

fn expand_secret(secret: &SecretString) -> SecretString {
    SecretString::from(expand_env_vars(secret.expose_secret()))
}

// Default value functions

fn default_client_id() -> String {
    "kafka-mtls-client".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_metadata_refresh_interval_secs() -> u64 {
    300
}

fn default_reconnect_backoff_ms() -> u64 {
    100
}

fn default_reconnect_backoff_max_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    1_000
}

fn default_max_request_size() -> usize {
    1_048_576
}

fn default_batch_size() -> usize {
    100
}

fn default_close_timeout_ms() -> u64 {
    30_000
}

fn default_group_id() -> String {
    "secure-consumer-group".to_string()
}

fn default_true() -> bool {
    true
}

fn default_auto_commit_interval_ms() -> u64 {
    5_000
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    3_000
}

fn default_rebalance_timeout_ms() -> u64 {
    30_000
}

fn default_max_poll_records() -> usize {
    500
}

fn default_fetch_max_wait_ms() -> u64 {
    100
}

fn default_fetch_max_bytes() -> i32 {
    52_428_800
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl KafkaConfig {
    /// Connection config for the given bootstrap list with default settings.
    #[must_use]
    pub fn new(bootstrap_servers: Vec<String>) -> Self {
        Self {
            bootstrap_servers,
            client_id: default_client_id(),
            connection_timeout_ms: default_connection_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            metadata_refresh_interval_secs: default_metadata_refresh_interval_secs(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            reconnect_backoff_max_ms: default_reconnect_backoff_max_ms(),
            security_protocol: SecurityProtocol::default(),
        }
    }

    /// Connection timeout as a `Duration`.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Request timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate the connection settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the bootstrap list is empty or malformed.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::NoBootstrapServers);
        }
        for server in &self.bootstrap_servers {
            parse_endpoint(server)?;
        }
        if self.reconnect_backoff_max_ms < self.reconnect_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "kafka.reconnect_backoff_max_ms",
                message: "must not be lower than reconnect_backoff_ms".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: Acks::default(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_request_size: default_max_request_size(),
            batch_size: default_batch_size(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl ProducerConfig {
    /// Validate the producer settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a setting is out of range.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "producer.batch_size",
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "producer.max_request_size",
                message: "must be positive".to_string(),
            });
        }
        if self.retry_backoff_max_ms < self.retry_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "producer.retry_backoff_max_ms",
                message: "must not be lower than retry_backoff_ms".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: AutoOffsetReset::default(),
            enable_auto_commit: true,
            auto_commit_interval_ms: default_auto_commit_interval_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            rebalance_timeout_ms: default_rebalance_timeout_ms(),
            max_poll_records: default_max_poll_records(),
            fetch_max_wait_ms: default_fetch_max_wait_ms(),
            fetch_max_bytes: default_fetch_max_bytes(),
            allow_auto_create_topics: true,
        }
    }
}

impl ConsumerConfig {
    /// Validate the consumer settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a setting is out of range.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "consumer.group_id",
                message: "must not be empty".to_string(),
            });
        }
        if self.max_poll_records == 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.max_poll_records",
                message: "must be at least 1".to_string(),
            });
        }
        if self.heartbeat_interval_ms >= self.session_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "consumer.heartbeat_interval_ms",
                message: "must be lower than session_timeout_ms".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl ClientConfig {
    /// Configuration for the given bootstrap list with default settings and
    /// no TLS section.
    #[must_use]
    pub fn new(bootstrap_servers: Vec<String>) -> Self {
        Self {
            kafka: KafkaConfig::new(bootstrap_servers),
            tls: None,
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        self.kafka.validate()?;
        if self.kafka.security_protocol.requires_tls() && self.tls.is_none() {
            return Err(ConfigError::MissingTls);
        }
        self.producer.validate()?;
        self.consumer.validate()
    }
}

/// Split a `host:port` endpoint.
///
/// # Errors
///
/// Returns `ConfigError::InvalidAddress` if the port is missing or not numeric.
pub fn parse_endpoint(endpoint: &str) -> ConfigResult<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(endpoint.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ConfigError::InvalidAddress(endpoint.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidAddress(endpoint.to_string()))?;
    Ok((host.to_string(), port))
}
