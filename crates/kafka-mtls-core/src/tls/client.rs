//! Mutually authenticated TLS channel establishment.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{AlertDescription, ClientConfig};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use super::credentials::{Credential, TrustAnchor};
use crate::broker::stream::connect_tcp;
use crate::config::{parse_endpoint, TlsConfig};
use crate::error::{ClientError, Result, TlsError};

/// Install the ring crypto provider if not already installed.
pub(crate) fn ensure_crypto_provider() {
    let _ = CryptoProvider::install_default(default_provider());
}

/// Holds this client's identity and the anchors used to verify brokers, and
/// opens verified, encrypted channels from them.
///
/// The context is immutable once built and is shared between connections
/// without locking.
#[derive(Clone)]
pub struct SecurityContext {
    connector: TlsConnector,
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext").finish_non_exhaustive()
    }
}

impl SecurityContext {
    /// Load the keystore and truststore named by the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Authentication` when the keystore cannot be
    /// opened with its password, and `ClientError::Tls` for missing or empty
    /// material. No network I/O happens here.
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        let credential = Credential::load(config)?;
        let trust = TrustAnchor::load(config)?;
        Self::new(credential, trust)
    }

    /// Build a context from already loaded material.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Tls` if rustls rejects the key or chain.
    pub fn new(credential: Credential, trust: TrustAnchor) -> Result<Self> {
        ensure_crypto_provider();

        let (chain, key) = credential.into_parts();
        let config = ClientConfig::builder()
            .with_root_certificates(trust.into_root_store())
            .with_client_auth_cert(chain, key)
            .map_err(|e| TlsError::Config(format!("failed to configure client auth: {e}")))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Open a TCP connection to `endpoint` and complete the mutual TLS handshake.
    ///
    /// Both the TCP connect and the handshake are bounded by `connect_timeout`.
    ///
    /// # Errors
    ///
    /// - `TrustVerification` if the broker's certificate does not chain to a trusted anchor
    /// - `Authentication` if the broker rejects this client's certificate
    /// - `Transport` for socket failures and timeouts
    #[instrument(skip(self), fields(endpoint = %endpoint))]
    pub async fn establish(
        &self,
        endpoint: &str,
        connect_timeout: Duration,
    ) -> Result<TlsStream<TcpStream>> {
        let (host, _port) = parse_endpoint(endpoint)?;
        let server_name = ServerName::try_from(host).map_err(|e| {
            ClientError::from(TlsError::Config(format!("invalid server name: {e}")))
        })?;

        let tcp = connect_tcp(endpoint, connect_timeout).await?;

        debug!("performing TLS handshake");
        match timeout(connect_timeout, self.connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => {
                debug!("TLS handshake completed");
                Ok(stream)
            }
            Ok(Err(e)) => {
                let err = classify_io_error(endpoint, e);
                warn!(error = %err, "TLS handshake failed");
                Err(err)
            }
            Err(_) => Err(ClientError::Transport {
                endpoint: endpoint.to_string(),
                message: format!(
                    "TLS handshake timed out after {}ms",
                    connect_timeout.as_millis()
                ),
            }),
        }
    }
}

/// Map an I/O error from a TLS channel onto the client error taxonomy.
///
/// Under TLS 1.3 a broker rejects the client certificate after the client
/// considers the handshake complete, so this also applies to the first
/// request on a fresh channel.
pub(crate) fn classify_io_error(endpoint: &str, err: io::Error) -> ClientError {
    let tls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    match tls_error {
        Some(rustls::Error::InvalidCertificate(reason)) => ClientError::TrustVerification {
            endpoint: endpoint.to_string(),
            message: format!("{reason:?}"),
        },
        Some(rustls::Error::AlertReceived(alert)) if rejects_client_certificate(*alert) => {
            ClientError::Authentication {
                endpoint: endpoint.to_string(),
                message: format!("broker sent alert {alert:?}"),
            }
        }
        Some(other) => ClientError::Transport {
            endpoint: endpoint.to_string(),
            message: other.to_string(),
        },
        None => ClientError::Transport {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        },
    }
}

fn rejects_client_certificate(alert: AlertDescription) -> bool {
    matches!(
        alert,
        AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateUnknown
            | AlertDescription::UnknownCA
            | AlertDescription::AccessDenied
            | AlertDescription::CertificateRequired
            | AlertDescription::HandshakeFailure
    )
}
