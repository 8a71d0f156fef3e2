//! proxylog
//!
//! A TCP relay that counts the bytes it forwards and publishes per-second
//! throughput as a live push stream and an optional append-only log.
//!
//! Connections reach their destination either through a SOCKS4 CONNECT
//! handshake or a fixed address set in configuration.

pub mod config;
pub mod connection;
pub mod counter;
pub mod protocol;
pub mod relay;
pub mod shutdown;
pub mod telemetry;

pub use config::Config;
pub use connection::ConnectionManager;
pub use counter::ByteCounter;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
