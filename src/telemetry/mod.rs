//! Telemetry Module
//! 
//! Samples the aggregate byte counter once per interval and publishes the
//! drained values to push-stream subscribers, a log file, and Prometheus.

pub mod metrics;
pub mod sampler;
pub mod server;
pub mod sink;
pub mod types;

pub use metrics::{RelayMetrics, SessionStage};
pub use sampler::Sampler;
pub use server::{create_router, TelemetryServer, TelemetryState};
pub use sink::{open_log_file, LogSink};
pub use types::{EmitPolicy, TelemetrySnapshot};
