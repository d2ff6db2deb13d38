//! Local entropy broker: many clients, one exclusive hardware TRNG.
//!
//! The broker owns the device for its whole lifetime and exposes it on a
//! Unix domain socket. A fixed pool of connection handlers speaks the binary
//! protocol in [`protocol`]; a single [`arbiter::DeviceArbiter`] executes
//! device commands one at a time.
//!
//! ```no_run
//! use noisepipe_core::BrokerConfig;
//! use noisepipe_server::EntropyBroker;
//!
//! # async fn run() -> noisepipe_core::Result<()> {
//! let broker = EntropyBroker::from_config(&BrokerConfig::default())?;
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! broker.run(shutdown).await
//! # }
//! ```

#![cfg(unix)]

pub mod arbiter;
pub mod broker;
pub mod client;
pub mod connection;
pub mod protocol;

pub use broker::EntropyBroker;
pub use client::BrokerClient;
pub use connection::ConnectionState;
pub use protocol::{MAX_TRANSFER, Opcode, Status};
