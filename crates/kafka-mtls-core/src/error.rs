//! Domain error types for the mutually authenticated Kafka clients.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

use crate::protocol::error_code;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// The bootstrap list is empty.
    #[error("at least one bootstrap server is required")]
    NoBootstrapServers,

    /// TLS settings are required for the configured security protocol.
    #[error("security protocol SSL requires a tls section")]
    MissingTls,

    /// A setting holds a value outside its valid range.
    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Errors raised while loading credential and trust material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlsError {
    /// Certificate file could not be read.
    #[error("failed to load certificate from '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// Private key file could not be read.
    #[error("failed to load private key from '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// No certificates were found in the given file.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// No private key was found in the given file.
    #[error("no private key found in '{0}'")]
    NoPrivateKeys(String),

    /// The keystore or truststore could not be decrypted with the supplied password.
    #[error("failed to open '{path}': {message}")]
    BadPassword { path: String, message: String },

    /// The rustls configuration could not be assembled.
    #[error("invalid TLS configuration: {0}")]
    Config(String),
}

/// Errors surfaced by the connection pool, producer, and consumer.
///
/// `Authentication`, `TrustVerification` and the material-loading variants are
/// fatal: retrying with the same credential cannot succeed. `Transport` and
/// `Timeout` are transient and retried internally up to the configured bounds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The broker refused this client's credential, or the credential itself is unusable.
    #[error("authentication failed for {endpoint}: {message}")]
    Authentication { endpoint: String, message: String },

    /// The broker presented a certificate that does not chain to a trusted anchor.
    #[error("broker certificate for {endpoint} not trusted: {message}")]
    TrustVerification { endpoint: String, message: String },

    /// No bootstrap endpoint could be reached.
    #[error("no bootstrap server reachable (tried {tried:?})")]
    UnreachableCluster { tried: Vec<String> },

    /// The topic does not exist and could not be created.
    #[error("cannot subscribe to '{topic}': {message}")]
    Subscription { topic: String, message: String },

    /// A record could not be delivered after the retry budget was spent.
    #[error("produce to {topic}-{partition} failed after {attempts} attempt(s): {reason}")]
    Produce {
        topic: String,
        partition: i32,
        attempts: u32,
        reason: String,
    },

    /// Network-level failure on an established or establishing channel.
    #[error("transport error talking to {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// The broker answered with a non-zero error code.
    #[error("broker error {code} ({}) from {api}", error_code::label(.code))]
    Broker { api: &'static str, code: i16 },

    /// Malformed frame, failed decode, or correlation mismatch.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    /// Credential or trust material could not be loaded.
    #[error(transparent)]
    Tls(TlsError),

    /// Invalid configuration supplied to a client.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The operation is not valid in the client's current lifecycle state.
    #[error("{operation} not allowed while consumer is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// The client has been closed.
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Whether the failure is transient and may succeed when repeated.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Broker { code, .. } => error_code::is_retriable(*code),
            _ => false,
        }
    }

    /// Whether the failure stems from the credential or trust configuration.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. }
                | Self::TrustVerification { .. }
                | Self::Tls(_)
                | Self::Config { .. }
        )
    }

    /// Whether the broker reported that its routing information is stale.
    #[must_use]
    pub fn needs_metadata_refresh(&self) -> bool {
        match self {
            Self::Broker { code, .. } => error_code::invalidates_metadata(*code),
            Self::Transport { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn broker(api: &'static str, code: i16) -> Self {
        Self::Broker { api, code }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

impl From<TlsError> for ClientError {
    /// A keystore that cannot be opened means the client holds no usable
    /// credential, which is reported as an authentication failure.
    fn from(err: TlsError) -> Self {
        match err {
            TlsError::BadPassword { path, message } => Self::Authentication {
                endpoint: path,
                message,
            },
            other => Self::Tls(other),
        }
    }
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

/// Outcome of a consumer run loop that did not finish cleanly.
///
/// `Handler` carries the caller's own error untouched; the library never
/// constructs or swallows it.
#[derive(Error, Debug)]
pub enum RunError<E> {
    /// The consumer itself failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The record handler returned an error.
    #[error("record handler failed: {0}")]
    Handler(E),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS material loading.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "producer.max_retries",
            message: "must be at most 100".to_string(),
        };
        assert!(err.to_string().contains("producer.max_retries"));
    }

    #[test]
    fn test_transport_is_retriable() {
        let err = ClientError::Transport {
            endpoint: "broker-1:9093".to_string(),
            message: "connection reset".to_string(),
        };
        assert!(err.is_retriable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_trust_failure_is_fatal() {
        let err = ClientError::TrustVerification {
            endpoint: "broker-1:9093".to_string(),
            message: "UnknownIssuer".to_string(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_broker_error_classification() {
        let retriable = ClientError::broker("Produce", error_code::NOT_LEADER_OR_FOLLOWER);
        assert!(retriable.is_retriable());
        assert!(retriable.needs_metadata_refresh());

        let terminal = ClientError::broker("Produce", error_code::MESSAGE_TOO_LARGE);
        assert!(!terminal.is_retriable());
        assert!(terminal.to_string().contains("MESSAGE_TOO_LARGE"));
    }

    #[test]
    fn test_tls_error_converts() {
        let err: ClientError = TlsError::NoCertificates("/tmp/ca.pem".to_string()).into();
        assert!(matches!(err, ClientError::Tls(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bad_password_is_authentication() {
        let err: ClientError = TlsError::BadPassword {
            path: "client.p12".to_string(),
            message: "mac verification failed".to_string(),
        }
        .into();
        assert!(matches!(err, ClientError::Authentication { .. }));
    }

    #[test]
    fn test_config_error_converts() {
        let err: ClientError = ConfigError::NoBootstrapServers.into();
        assert!(matches!(err, ClientError::Config { .. }));
    }

    #[test]
    fn test_run_error_keeps_handler_error() {
        let err: RunError<std::io::Error> =
            RunError::Handler(std::io::Error::new(std::io::ErrorKind::Other, "bad record"));
        assert_eq!(err.to_string(), "record handler failed: bad record");

        let err: RunError<std::io::Error> = ClientError::Closed.into();
        assert!(matches!(err, RunError::Client(ClientError::Closed)));
    }
}
