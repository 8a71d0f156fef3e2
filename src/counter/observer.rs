//! Byte Observers

use std::fmt;
use std::sync::Arc;

/// Receives the number of bytes each successful relay write reported.
pub trait ByteObserver: Send + Sync {
    fn observe(&self, bytes: u64);
}

impl<T: ByteObserver + ?Sized> ByteObserver for Arc<T> {
    fn observe(&self, bytes: u64) {
        (**self).observe(bytes);
    }
}

/// Observer that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ByteObserver for NullObserver {
    fn observe(&self, _bytes: u64) {}
}

/// Forwards every observation to each wrapped observer in order
#[derive(Clone, Default)]
pub struct Tee {
    observers: Vec<Arc<dyn ByteObserver>>,
}

impl Tee {
    pub fn new(observers: Vec<Arc<dyn ByteObserver>>) -> Self {
        Self { observers }
    }

    /// Add another observer to the fan-out
    pub fn with(mut self, observer: Arc<dyn ByteObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ByteObserver for Tee {
    fn observe(&self, bytes: u64) {
        for observer in &self.observers {
            observer.observe(bytes);
        }
    }
}

impl fmt::Debug for Tee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tee")
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Copy direction of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to remote
    Up,
    /// Remote to client
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "client -> remote"),
            Direction::Down => write!(f, "remote -> client"),
        }
    }
}
