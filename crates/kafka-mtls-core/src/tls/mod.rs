//! Transport security for broker connections.
//!
//! A [`SecurityContext`] is built once from the client's keystore and
//! truststore and then opens mutually authenticated channels:
//!
//! ```rust,ignore
//! use kafka_mtls_core::tls::SecurityContext;
//!
//! let context = SecurityContext::from_config(&tls_config)?;
//! let stream = context.establish("broker-1:9093", Duration::from_secs(10)).await?;
//! ```

pub mod client;
pub mod credentials;

pub use client::SecurityContext;
pub use credentials::{Credential, TrustAnchor};
