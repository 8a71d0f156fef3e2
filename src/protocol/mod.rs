//! SOCKS4 Protocol Implementation
//! 
//! This module contains the SOCKS4 CONNECT negotiation used to learn a
//! session's destination.

pub mod constants;
pub mod handler;
pub mod types;

pub use constants::*;
pub use handler::Socks4Handler;
pub use types::*;
