//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::counter::{ByteObserver, Direction};

/// Represents an active relay session
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub destination: String,
    pub start_time: Instant,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(client_addr: SocketAddr, destination: String) -> Self {
        let session_id = Uuid::new_v4().to_string();
        debug!("Creating new relay session: {} ({} -> {})",
               session_id, client_addr, destination);

        Self {
            session_id,
            client_addr,
            destination,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Get bytes transferred upstream (client to remote)
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Get bytes transferred downstream (remote to client)
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    /// Get total bytes transferred
    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    /// Get session duration
    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Up => self.bytes_up.fetch_add(bytes, Ordering::Relaxed),
            Direction::Down => self.bytes_down.fetch_add(bytes, Ordering::Relaxed),
        };
    }

    /// Observer that tallies one direction into this session
    pub fn observer(self: &Arc<Self>, direction: Direction) -> Arc<dyn ByteObserver> {
        Arc::new(SessionTally {
            session: Arc::clone(self),
            direction,
        })
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            client_addr = %self.client_addr,
            destination = %self.destination,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            total_bytes = self.total_bytes(),
            "Relay session completed"
        );
    }
}

struct SessionTally {
    session: Arc<RelaySession>,
    direction: Direction,
}

impl ByteObserver for SessionTally {
    fn observe(&self, bytes: u64) {
        self.session.add_bytes(self.direction, bytes);
    }
}
