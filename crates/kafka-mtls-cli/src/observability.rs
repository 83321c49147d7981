//! Tracing setup, the Prometheus endpoint and shutdown signals.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_mtls_core::config::{LoggingConfig, MetricsConfig};
use kafka_mtls_core::ClientMetrics;

/// Log level from configuration, raised by each `-v`.
#[must_use]
pub fn effective_level(config: &LoggingConfig, verbose: u8) -> Level {
    match verbose {
        0 => match config.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        },
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the global subscriber. `RUST_LOG` directives are honored on top
/// of the configured level.
pub fn setup_tracing(config: &LoggingConfig, verbose: u8) {
    let filter = EnvFilter::from_default_env().add_directive(effective_level(config, verbose).into());
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

/// Serve the metrics text exposition in the background when enabled.
pub fn spawn_metrics_server(config: &MetricsConfig, metrics: Arc<ClientMetrics>) {
    if !config.enabled {
        return;
    }

    let address = config.address.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_metrics(&address, metrics).await {
            error!(error = %e, address, "metrics server error");
        }
    });
}

async fn serve_metrics(
    addr: &str,
    metrics: Arc<ClientMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    let body = metrics.encode().unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %e, "metrics connection error");
            }
        });
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_overrides_config_level() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            json: false,
        };
        assert_eq!(effective_level(&config, 0), Level::WARN);
        assert_eq!(effective_level(&config, 1), Level::DEBUG);
        assert_eq!(effective_level(&config, 3), Level::TRACE);
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let config = LoggingConfig {
            level: "chatty".to_string(),
            json: false,
        };
        assert_eq!(effective_level(&config, 0), Level::INFO);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_exposition() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = placeholder.local_addr().unwrap().to_string();
        drop(placeholder);

        let metrics = Arc::new(ClientMetrics::new());
        metrics.record_produced("orders", 3);
        spawn_metrics_server(
            &MetricsConfig {
                enabled: true,
                address: address.clone(),
            },
            metrics,
        );

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = tokio::net::TcpStream::connect(&address).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let mut stream = stream.expect("metrics server should accept connections");
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("orders"));
    }
}
