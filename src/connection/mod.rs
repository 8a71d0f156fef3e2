//! Connection Management Module
//! 
//! Handles TCP connection acceptance and per-connection session lifecycle.

pub mod manager;

pub use manager::{ActiveSessions, ConnectionManager, Observers};
