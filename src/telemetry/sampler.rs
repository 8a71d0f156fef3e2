//! Telemetry Sampler

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::TelemetrySnapshot;
use crate::counter::ByteCounter;

const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Sole drainer of the process-wide byte counter.
///
/// Once per interval it drains the counter and broadcasts the value to every
/// subscriber (push streams, the log sink), so consumers never compete for
/// increments.
pub struct Sampler {
    counter: Arc<ByteCounter>,
    interval: Duration,
    snapshots: broadcast::Sender<TelemetrySnapshot>,
}

impl Sampler {
    pub fn new(counter: Arc<ByteCounter>, interval: Duration) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            counter,
            interval,
            snapshots,
        }
    }

    /// Receive every snapshot taken after this call
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetrySnapshot> {
        self.snapshots.subscribe()
    }

    /// Handle for subscribing later, e.g. per HTTP request
    pub fn feed(&self) -> broadcast::Sender<TelemetrySnapshot> {
        self.snapshots.clone()
    }

    /// Tick until shutdown. The first tick fires one interval after start.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Telemetry sampler started (interval: {:?})", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Telemetry sampler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = TelemetrySnapshot::new(self.counter.drain());
                    trace!(bytes = snapshot.bytes, "Telemetry tick");
                    // No subscribers is fine; the bytes are still drained.
                    let _ = self.snapshots.send(snapshot);
                }
            }
        }

        info!("Telemetry sampler stopped");
    }
}
