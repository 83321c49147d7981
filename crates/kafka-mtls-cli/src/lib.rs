//! Shared plumbing for the `secure-producer` and `secure-consumer` binaries.
//!
//! Both take `<brokers> <topic> <keystore>` positionally and build a
//! [`ClientConfig`](kafka_mtls_core::ClientConfig) from those, the optional
//! `--config` file and the credential flags.

#![forbid(unsafe_code)]

pub mod args;
pub mod observability;

pub use args::{parse_args, CommonArgs, USAGE_EXIT_CODE};
pub use observability::{setup_tracing, shutdown_signal, spawn_metrics_server};
