//! SOCKS4 Protocol Types

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::*;

/// How much of the variable-length USERID field is consumed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserIdMode {
    /// Read exactly one USERID byte (nine request bytes in total).
    /// Suits clients that send an empty user id.
    #[default]
    Fixed,
    /// Read USERID up to and including its NUL terminator.
    NullTerminated,
}

impl FromStr for UserIdMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(UserIdMode::Fixed),
            "null_terminated" | "null-terminated" => Ok(UserIdMode::NullTerminated),
            other => Err(anyhow!(
                "Unknown user id mode '{}', expected 'fixed' or 'null_terminated'",
                other
            )),
        }
    }
}

impl fmt::Display for UserIdMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserIdMode::Fixed => write!(f, "fixed"),
            UserIdMode::NullTerminated => write!(f, "null_terminated"),
        }
    }
}

/// SOCKS4 CONNECT request from client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Request {
    pub version: u8,
    pub command: u8,
    pub port: u16,
    pub addr: Ipv4Addr,
    /// USERID bytes as read, without the terminator. Never authenticated.
    pub user_id: Vec<u8>,
}

impl Socks4Request {
    /// Parse the fixed 8-byte header
    pub fn from_header(header: &[u8; SOCKS4_REQUEST_HEADER_LEN]) -> Self {
        Self {
            version: header[0],
            command: header[1],
            port: u16::from_be_bytes([header[2], header[3]]),
            addr: Ipv4Addr::new(header[4], header[5], header[6], header[7]),
            user_id: Vec::new(),
        }
    }

    /// Destination the client asked for
    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr, self.port)
    }
}

/// SOCKS4 reply sent to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socks4Reply {
    pub code: u8,
}

impl Socks4Reply {
    pub fn granted() -> Self {
        Self {
            code: SOCKS4_REPLY_GRANTED,
        }
    }

    /// Wire form. DSTPORT and DSTIP are left zero, which CONNECT clients ignore.
    pub fn to_bytes(&self) -> [u8; SOCKS4_REPLY_LEN] {
        let mut reply = [0u8; SOCKS4_REPLY_LEN];
        reply[0] = SOCKS4_REPLY_VERSION;
        reply[1] = self.code;
        reply
    }
}
