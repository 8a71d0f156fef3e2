//! Relay Metrics
//!
//! Lifetime counters exported in Prometheus text format at `/metrics`.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::counter::{ByteObserver, Direction};
use crate::Result;

/// Stage at which a session was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Handshake,
    Dial,
    Relay,
}

impl SessionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStage::Handshake => "handshake",
            SessionStage::Dial => "dial",
            SessionStage::Relay => "relay",
        }
    }
}

/// Prometheus collectors for the relay
pub struct RelayMetrics {
    registry: Registry,
    bytes_total: IntCounterVec,
    sessions_total: IntCounter,
    active_sessions: IntGauge,
    session_errors_total: IntCounterVec,
}

impl RelayMetrics {
    /// Create the collectors and register them on a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let bytes_total = IntCounterVec::new(
            Opts::new("proxylog_bytes_total", "Bytes written by the relay"),
            &["direction"],
        )?;
        let sessions_total = IntCounter::new(
            "proxylog_sessions_total",
            "Relay sessions accepted",
        )?;
        let active_sessions = IntGauge::new(
            "proxylog_active_sessions",
            "Relay sessions currently open",
        )?;
        let session_errors_total = IntCounterVec::new(
            Opts::new("proxylog_session_errors_total", "Relay sessions that ended in an error"),
            &["stage"],
        )?;

        registry.register(Box::new(bytes_total.clone()))?;
        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(session_errors_total.clone()))?;

        Ok(Self {
            registry,
            bytes_total,
            sessions_total,
            active_sessions,
            session_errors_total,
        })
    }

    /// Observer that counts one relay direction
    pub fn observer(&self, direction: Direction) -> Arc<dyn ByteObserver> {
        Arc::new(DirectionBytes(
            self.bytes_total.with_label_values(&[direction.as_str()]),
        ))
    }

    pub fn session_opened(&self) {
        self.sessions_total.inc();
        self.active_sessions.inc();
    }

    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }

    pub fn session_failed(&self, stage: SessionStage) {
        self.session_errors_total
            .with_label_values(&[stage.as_str()])
            .inc();
    }

    pub fn bytes(&self, direction: Direction) -> u64 {
        self.bytes_total.with_label_values(&[direction.as_str()]).get()
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }

    pub fn session_errors(&self, stage: SessionStage) -> u64 {
        self.session_errors_total
            .with_label_values(&[stage.as_str()])
            .get()
    }

    /// Render all collectors in Prometheus text exposition format
    pub fn export_prometheus(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

struct DirectionBytes(IntCounter);

impl ByteObserver for DirectionBytes {
    fn observe(&self, bytes: u64) {
        self.0.inc_by(bytes);
    }
}
