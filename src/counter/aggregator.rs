//! Byte Aggregator

use std::sync::atomic::{AtomicU64, Ordering};

use super::ByteObserver;

/// Process-wide accumulator of bytes relayed since the last drain.
///
/// Any number of relay tasks may call [`ByteCounter::add`] concurrently.
/// Draining is reserved for a single owner: every [`ByteCounter::drain`]
/// hands out the bytes seen since the previous drain by *anyone*, so two
/// independent drainers would split the stream of increments between them.
/// In this crate the telemetry sampler is that owner and fans the drained
/// value out to every consumer.
#[derive(Debug, Default)]
pub struct ByteCounter {
    bytes: AtomicU64,
}

impl ByteCounter {
    /// Create an empty counter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bytes` more bytes
    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Atomically take the accumulated value and reset it to zero.
    ///
    /// An increment racing with the drain lands either in the returned value
    /// or in the next one, never in both and never in neither.
    pub fn drain(&self) -> u64 {
        self.bytes.swap(0, Ordering::AcqRel)
    }

    /// Current value without resetting it
    pub fn load(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }
}

impl ByteObserver for ByteCounter {
    fn observe(&self, bytes: u64) {
        self.add(bytes);
    }
}
