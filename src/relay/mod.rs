//! Data Relay Module
//! 
//! Handles bidirectional data relay between client and remote.

pub mod engine;
pub mod session;

pub use engine::{copy_direction, CopyOutcome, RelayEngine, RelayStats, DEFAULT_BUFFER_SIZE};
pub use session::RelaySession;
