//! Byte Accounting Module
//!
//! Lock-free byte aggregation and the observer seam the relay reports through.

pub mod aggregator;
pub mod observer;

pub use aggregator::ByteCounter;
pub use observer::{ByteObserver, Direction, NullObserver, Tee};
