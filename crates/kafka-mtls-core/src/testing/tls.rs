//! Server side of the mutual TLS handshake for the mock broker.
//!
//! The acceptor presents a broker certificate and requires every client to
//! present a certificate issued by the configured CA, the way a Kafka
//! listener with `ssl.client.auth=required` behaves.

use std::path::Path;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::{TlsError, TlsResult};
use crate::tls::client::ensure_crypto_provider;
use crate::tls::credentials::{load_certificates, load_private_key};

/// Accepts inbound TLS connections and verifies client certificates.
#[derive(Clone)]
pub struct BrokerTlsAcceptor {
    inner: TlsAcceptor,
}

impl std::fmt::Debug for BrokerTlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerTlsAcceptor").finish_non_exhaustive()
    }
}

impl BrokerTlsAcceptor {
    /// Build an acceptor from PEM files.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be loaded or rustls rejects the
    /// resulting configuration.
    pub fn new(cert_path: &Path, key_path: &Path, client_ca_path: &Path) -> TlsResult<Self> {
        ensure_crypto_provider();

        let certs = load_certificates(cert_path)?;
        let key = load_private_key(key_path)?;

        let mut roots = RootCertStore::empty();
        for ca in load_certificates(client_ca_path)? {
            roots
                .add(ca)
                .map_err(|e| TlsError::Config(format!("invalid client CA certificate: {e}")))?;
        }

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::Config(format!("failed to build client verifier: {e}")))?;

        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("failed to configure server cert: {e}")))?;

        debug!(
            cert = %cert_path.display(),
            client_ca = %client_ca_path.display(),
            "broker TLS acceptor ready"
        );
        Ok(Self {
            inner: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Complete the server half of the handshake.
    ///
    /// # Errors
    ///
    /// Returns the handshake failure, including a rejected client certificate.
    pub async fn accept(&self, stream: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
        self.inner.accept(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[test]
    fn test_acceptor_from_fixtures() {
        let acceptor = BrokerTlsAcceptor::new(
            &fixture("broker.pem"),
            &fixture("broker.key"),
            &fixture("ca.pem"),
        );
        assert!(acceptor.is_ok());
    }

    #[test]
    fn test_acceptor_missing_key() {
        let err = BrokerTlsAcceptor::new(
            &fixture("broker.pem"),
            &fixture("does-not-exist.key"),
            &fixture("ca.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, TlsError::PrivateKeyLoad { .. }));
    }
}
