//! Single Kafka broker connection.
//!
//! Manages one channel to a broker with correlation ID tracking for
//! request/response matching. The channel is opened lazily and re-opened on
//! the next request after any I/O failure.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use super::stream::BrokerStream;
use crate::error::{ClientError, Result};
use crate::metrics::ClientMetrics;
use crate::protocol::{decode_response, encode_request, KafkaRequest};
use crate::tls::client::classify_io_error;
use crate::tls::SecurityContext;

/// Largest response frame accepted from a broker.
const MAX_RESPONSE_SIZE: usize = 256 * 1024 * 1024;

/// Settings shared by every connection a pool opens.
#[derive(Clone)]
pub struct ConnectionSettings {
    /// Client id carried in request headers.
    pub client_id: String,
    /// Bound on TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    /// Bound on one request round trip.
    pub request_timeout: Duration,
    /// TLS context; `None` means plaintext.
    pub security: Option<Arc<SecurityContext>>,
    /// Metrics sink.
    pub metrics: Arc<ClientMetrics>,
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("client_id", &self.client_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("tls", &self.security.is_some())
            .finish()
    }
}

/// A connection to a single Kafka broker.
pub struct BrokerConnection {
    broker_id: i32,
    address: String,
    stream: Mutex<Option<BrokerStream>>,
    correlation_id: AtomicI32,
    ever_connected: AtomicBool,
    settings: ConnectionSettings,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("broker_id", &self.broker_id)
            .field("address", &self.address)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl BrokerConnection {
    /// Create a new broker connection (not yet connected).
    #[must_use]
    pub fn new(broker_id: i32, address: String, settings: ConnectionSettings) -> Self {
        Self {
            broker_id,
            address,
            stream: Mutex::new(None),
            correlation_id: AtomicI32::new(0),
            ever_connected: AtomicBool::new(false),
            settings,
        }
    }

    /// Get the broker ID. Bootstrap connections use negative ids.
    #[must_use]
    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    /// Get the broker address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Check if the connection is established.
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Open the channel if it is not open yet.
    ///
    /// # Errors
    ///
    /// Returns the classified connect or handshake failure.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        self.ensure_open(&mut guard).await
    }

    #[instrument(skip(self, slot), fields(broker_id = self.broker_id, address = %self.address))]
    async fn ensure_open(&self, slot: &mut Option<BrokerStream>) -> Result<()> {
        if slot.is_some() {
            return Ok(());
        }

        let stream = BrokerStream::open(
            &self.address,
            self.settings.security.as_deref(),
            self.settings.connect_timeout,
        )
        .await?;

        let is_reconnect = self.ever_connected.swap(true, Ordering::Relaxed);
        self.settings.metrics.connection_opened(is_reconnect);
        debug!(tls = stream.is_tls(), is_reconnect, "connected to broker");
        *slot = Some(stream);
        Ok(())
    }

    /// Close the channel. The next request re-opens it.
    pub async fn disconnect(&self) {
        if self.stream.lock().await.take().is_some() {
            self.settings.metrics.connection_closed();
        }
    }

    /// Get the next correlation ID.
    pub fn next_correlation_id(&self) -> i32 {
        self.correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a typed request and decode its response.
    ///
    /// # Errors
    ///
    /// Returns a transport error (and drops the channel) on I/O failure or
    /// timeout, an authentication or trust error if the TLS peer rejected the
    /// channel, and a protocol error on a malformed or mismatched response.
    pub async fn call<R: KafkaRequest>(&self, request: &R) -> Result<R::Response> {
        let correlation_id = self.next_correlation_id();
        let frame = encode_request(request, correlation_id, &self.settings.client_id)?;

        let started = Instant::now();
        let result = self.round_trip(frame, correlation_id, true).await;
        self.observe(R::NAME, started, &result);

        let body = result?.ok_or_else(|| ClientError::protocol("missing response"))?;
        decode_response::<R>(body)
    }

    /// Send a request for which the broker writes no response.
    ///
    /// Only produce requests with `acks = 0` qualify.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the frame cannot be written.
    pub async fn send_oneway<R: KafkaRequest>(&self, request: &R) -> Result<()> {
        let correlation_id = self.next_correlation_id();
        let frame = encode_request(request, correlation_id, &self.settings.client_id)?;

        let started = Instant::now();
        let result = self.round_trip(frame, correlation_id, false).await;
        self.observe(R::NAME, started, &result);
        result.map(|_| ())
    }

    fn observe(&self, api: &'static str, started: Instant, result: &Result<Option<Bytes>>) {
        match result {
            Ok(_) => self
                .settings
                .metrics
                .record_request(api, started.elapsed().as_secs_f64()),
            Err(e) => self.settings.metrics.record_error(api, error_kind(e)),
        }
    }

    async fn round_trip(
        &self,
        frame: BytesMut,
        correlation_id: i32,
        expect_response: bool,
    ) -> Result<Option<Bytes>> {
        let mut guard = self.stream.lock().await;
        self.ensure_open(&mut guard).await?;
        // Out of the slot for the exchange: a caller that abandons the request
        // drops the stream with it rather than leave an unread response behind.
        let Some(mut stream) = guard.take() else {
            return Err(ClientError::protocol("channel not open"));
        };

        debug!(correlation_id, request_len = frame.len(), "sending request");

        let mut write_buf = BytesMut::with_capacity(4 + frame.len());
        write_buf.put_u32(frame.len() as u32);
        write_buf.extend_from_slice(&frame);

        let request_timeout = self.settings.request_timeout;
        let exchange = async {
            stream.write_all(&write_buf).await?;
            stream.flush().await?;
            if !expect_response {
                return Ok::<_, std::io::Error>(None);
            }

            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let response_len = u32::from_be_bytes(len_buf) as usize;
            if response_len > MAX_RESPONSE_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("response frame of {response_len} bytes exceeds limit"),
                ));
            }

            let mut response_buf = vec![0u8; response_len];
            stream.read_exact(&mut response_buf).await?;
            Ok(Some(response_buf))
        };

        let outcome = timeout(request_timeout, exchange).await;
        let response_buf = match outcome {
            Ok(Ok(Some(buf))) => {
                *guard = Some(stream);
                buf
            }
            Ok(Ok(None)) => {
                *guard = Some(stream);
                return Ok(None);
            }
            Ok(Err(e)) => {
                // Connection may be broken, leave the slot empty
                self.settings.metrics.connection_closed();
                let err = classify_io_error(&self.address, e);
                warn!(broker_id = self.broker_id, error = %err, "request failed");
                return Err(err);
            }
            Err(_) => {
                // A late response would desynchronise correlation ids.
                self.settings.metrics.connection_closed();
                return Err(ClientError::Timeout {
                    operation: "broker request",
                    timeout_ms: request_timeout.as_millis() as u64,
                });
            }
        };
        drop(guard);

        // Verify correlation ID in response (first 4 bytes)
        if response_buf.len() < 4 {
            return Err(ClientError::protocol("response too short"));
        }

        let response_correlation_id = i32::from_be_bytes([
            response_buf[0],
            response_buf[1],
            response_buf[2],
            response_buf[3],
        ]);

        if response_correlation_id != correlation_id {
            self.disconnect().await;
            return Err(ClientError::protocol(format!(
                "correlation id mismatch: expected {correlation_id}, got {response_correlation_id}"
            )));
        }

        debug!(
            correlation_id,
            response_len = response_buf.len(),
            "received response"
        );

        let mut body = Bytes::from(response_buf);
        let _ = body.split_to(4);
        Ok(Some(body))
    }
}

fn error_kind(err: &ClientError) -> &'static str {
    match err {
        ClientError::Authentication { .. } => "authentication",
        ClientError::TrustVerification { .. } => "trust_verification",
        ClientError::Transport { .. } => "transport",
        ClientError::Timeout { .. } => "timeout",
        ClientError::Protocol { .. } => "protocol",
        _ => "other",
    }
}
