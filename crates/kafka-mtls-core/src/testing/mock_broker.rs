//! Mock Kafka broker for integration testing.
//!
//! Accepts plain or mutually authenticated TLS connections, records every
//! request it receives and answers through per-API handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::tls::BrokerTlsAcceptor;

/// API keys for Kafka protocol
pub mod api_keys {
    pub const PRODUCE: i16 = 0;
    pub const FETCH: i16 = 1;
    pub const LIST_OFFSETS: i16 = 2;
    pub const METADATA: i16 = 3;
    pub const OFFSET_COMMIT: i16 = 8;
    pub const OFFSET_FETCH: i16 = 9;
    pub const FIND_COORDINATOR: i16 = 10;
    pub const JOIN_GROUP: i16 = 11;
    pub const HEARTBEAT: i16 = 12;
    pub const LEAVE_GROUP: i16 = 13;
    pub const SYNC_GROUP: i16 = 14;
}

/// A recorded broker call.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    /// The API key of the request.
    pub api_key: i16,
    /// The API version of the request.
    pub api_version: i16,
    /// The correlation ID.
    pub correlation_id: i32,
    /// The raw request bytes, header included, without length prefix.
    pub request_bytes: Bytes,
}

/// What a handler sends back for one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write this frame body (correlation id first) immediately.
    Frame(Bytes),
    /// Write the frame after a pause, the way a broker parks a fetch until
    /// data arrives or `max_wait_ms` passes.
    Delayed(Duration, Bytes),
    /// Send nothing, as for a produce with `acks=0`.
    Silent,
}

/// Response generator function type.
pub type ResponseGenerator = Arc<dyn Fn(&BrokerCall) -> Reply + Send + Sync>;

type Handlers = Arc<RwLock<HashMap<i16, ResponseGenerator>>>;

/// Mock Kafka broker for testing.
pub struct MockBroker {
    address: String,
    tls: Option<BrokerTlsAcceptor>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    call_log: Arc<RwLock<Vec<BrokerCall>>>,
    response_handlers: Handlers,
    accepted: Arc<AtomicUsize>,
}

impl MockBroker {
    /// Create a plaintext mock broker that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: None,
            shutdown_tx: None,
            call_log: Arc::new(RwLock::new(Vec::new())),
            response_handlers: Arc::new(RwLock::new(HashMap::new())),
            accepted: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Require mutual TLS on every accepted connection.
    #[must_use]
    pub fn with_tls(mut self, acceptor: BrokerTlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Start the mock broker.
    ///
    /// Returns the actual address the broker is listening on, which also
    /// becomes [`address`](Self::address).
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        self.address = listener.local_addr()?.to_string();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let tls = self.tls.clone();
        let call_log = Arc::clone(&self.call_log);
        let response_handlers = Arc::clone(&self.response_handlers);
        let accepted = Arc::clone(&self.accepted);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Ok((stream, peer)) = result else { break };
                        accepted.fetch_add(1, Ordering::Relaxed);
                        let _ = stream.set_nodelay(true);
                        let tls = tls.clone();
                        let call_log = Arc::clone(&call_log);
                        let response_handlers = Arc::clone(&response_handlers);
                        let shutdown_rx = shutdown_tx.subscribe();

                        tokio::spawn(async move {
                            match tls {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(stream) => {
                                        Self::handle_connection(stream, call_log, response_handlers, shutdown_rx).await;
                                    }
                                    Err(e) => debug!(%peer, error = %e, "mock broker rejected TLS client"),
                                },
                                None => {
                                    Self::handle_connection(stream, call_log, response_handlers, shutdown_rx).await;
                                }
                            }
                        });
                    }
                }
            }
        });

        Ok(self.address.clone())
    }

    /// Stop accepting and close every open connection.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Register a response handler for a specific API key.
    pub async fn register_handler(&self, api_key: i16, handler: ResponseGenerator) {
        self.response_handlers
            .write()
            .await
            .insert(api_key, handler);
    }

    /// Get all recorded calls.
    pub async fn get_calls(&self) -> Vec<BrokerCall> {
        self.call_log.read().await.clone()
    }

    /// Get calls filtered by API key.
    pub async fn get_calls_for_api(&self, api_key: i16) -> Vec<BrokerCall> {
        self.call_log
            .read()
            .await
            .iter()
            .filter(|c| c.api_key == api_key)
            .cloned()
            .collect()
    }

    /// TCP connections accepted so far, including ones that failed the TLS handshake.
    #[must_use]
    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.call_log.write().await.clear();
    }

    /// The broker address; the bound address once started.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Host and port of the bound address, as advertised in metadata.
    #[must_use]
    pub fn host_port(&self) -> (String, i32) {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .unwrap_or((self.address.as_str(), "0"));
        (host.to_string(), port.parse().unwrap_or(0))
    }

    async fn handle_connection<S>(
        mut stream: S,
        call_log: Arc<RwLock<Vec<BrokerCall>>>,
        response_handlers: Handlers,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = Self::read_frame(&mut stream) => match result {
                    Ok(Some(frame)) => frame,
                    Ok(None) | Err(_) => break,
                },
            };

            if frame.len() < 8 {
                continue;
            }
            let call = BrokerCall {
                api_key: i16::from_be_bytes([frame[0], frame[1]]),
                api_version: i16::from_be_bytes([frame[2], frame[3]]),
                correlation_id: i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
                request_bytes: Bytes::from(frame),
            };
            call_log.write().await.push(call.clone());

            let reply = {
                let handlers = response_handlers.read().await;
                match handlers.get(&call.api_key) {
                    Some(handler) => handler(&call),
                    None => Reply::Frame(Self::default_response(&call)),
                }
            };

            let response = match reply {
                Reply::Frame(bytes) => bytes,
                Reply::Delayed(delay, bytes) => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        () = tokio::time::sleep(delay) => bytes,
                    }
                }
                Reply::Silent => continue,
            };

            if Self::write_frame(&mut stream, &response).await.is_err() {
                break;
            }
        }
    }

    /// Read a Kafka frame (4-byte length prefix + body).
    async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    /// Write a Kafka frame (4-byte length prefix + body).
    async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> std::io::Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
        let mut buf = BytesMut::with_capacity(4 + data.len());
        buf.put_u32(len);
        buf.extend_from_slice(data);
        stream.write_all(&buf).await?;
        stream.flush().await
    }

    /// Generate a default response (correlation ID only).
    fn default_response(call: &BrokerCall) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_i32(call.correlation_id);
        buf.freeze()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    async fn roundtrip(address: &str, api_key: i16, correlation_id: i32) -> Option<Vec<u8>> {
        let mut stream = TcpStream::connect(address).await.unwrap();
        let mut frame = BytesMut::new();
        frame.put_i16(api_key);
        frame.put_i16(0);
        frame.put_i32(correlation_id);
        MockBroker::write_frame(&mut stream, &frame).await.unwrap();

        tokio::time::timeout(Duration::from_millis(200), MockBroker::read_frame(&mut stream))
            .await
            .ok()
            .and_then(|r| r.unwrap())
    }

    #[tokio::test]
    async fn test_mock_broker_records_calls() {
        let mut broker = MockBroker::new("127.0.0.1:0");
        let address = broker.start().await.unwrap();

        let response = roundtrip(&address, api_keys::METADATA, 7).await.unwrap();
        assert_eq!(response, 7i32.to_be_bytes());

        let calls = broker.get_calls_for_api(api_keys::METADATA).await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].correlation_id, 7);

        broker.clear_calls().await;
        assert!(broker.get_calls().await.is_empty());
        broker.stop();
    }

    #[tokio::test]
    async fn test_silent_handler_sends_nothing() {
        let mut broker = MockBroker::new("127.0.0.1:0");
        let address = broker.start().await.unwrap();
        broker
            .register_handler(api_keys::PRODUCE, Arc::new(|_| Reply::Silent))
            .await;

        assert!(roundtrip(&address, api_keys::PRODUCE, 1).await.is_none());
        assert_eq!(broker.get_calls_for_api(api_keys::PRODUCE).await.len(), 1);
    }

    #[test]
    fn test_host_port() {
        let broker = MockBroker::new("127.0.0.1:19092");
        assert_eq!(broker.host_port(), ("127.0.0.1".to_string(), 19092));
    }
}
