//! Stream abstraction for broker connections.
//!
//! Provides a unified interface over plain TCP and TLS streams.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::tls::SecurityContext;

/// A stream that can be either plain TCP or TLS-encrypted.
pub enum BrokerStream {
    /// Plain TCP connection (PLAINTEXT).
    Plain(TcpStream),
    /// Mutually authenticated TLS connection (SSL).
    Tls(Box<TlsStream<TcpStream>>),
}

impl BrokerStream {
    /// Open a stream to `endpoint`, over TLS when a security context is given.
    ///
    /// # Errors
    ///
    /// Returns the classified connect or handshake failure.
    pub async fn open(
        endpoint: &str,
        security: Option<&SecurityContext>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        match security {
            Some(context) => context
                .establish(endpoint, connect_timeout)
                .await
                .map(|s| Self::Tls(Box::new(s))),
            None => connect_tcp(endpoint, connect_timeout).await.map(Self::Plain),
        }
    }

    /// Check if this is a TLS connection.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

/// Connect a TCP socket, bounded by `connect_timeout`.
pub(crate) async fn connect_tcp(endpoint: &str, connect_timeout: Duration) -> Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(stream)) => {
            // Requests are small and latency sensitive.
            let _ = stream.set_nodelay(true);
            debug!(endpoint, "TCP connection established");
            Ok(stream)
        }
        Ok(Err(e)) => Err(ClientError::Transport {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Err(ClientError::Transport {
            endpoint: endpoint.to_string(),
            message: format!("connect timed out after {}ms", connect_timeout.as_millis()),
        }),
    }
}

impl AsyncRead for BrokerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            BrokerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BrokerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BrokerStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            BrokerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            BrokerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            BrokerStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_plaintext() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let stream = BrokerStream::open(&address, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!stream.is_tls());
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = connect_tcp(&address, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ClientError::Transport { .. })));
    }
}
