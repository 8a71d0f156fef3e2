//! SOCKS4 Protocol Constants

// SOCKS4 Protocol Version
pub const SOCKS4_VERSION: u8 = 0x04;

// SOCKS4 Commands
pub const SOCKS4_CMD_CONNECT: u8 = 0x01;

// Request layout: VN CD DSTPORT(2) DSTIP(4)
pub const SOCKS4_REQUEST_HEADER_LEN: usize = 8;

// Header plus the first byte of USERID
pub const SOCKS4_FIXED_REQUEST_LEN: usize = SOCKS4_REQUEST_HEADER_LEN + 1;

// Upper bound on a NUL-terminated USERID, terminator included
pub const SOCKS4_MAX_USER_ID_LEN: usize = 255;

// Reply version byte (always zero)
pub const SOCKS4_REPLY_VERSION: u8 = 0x00;

// Reply code: request granted
pub const SOCKS4_REPLY_GRANTED: u8 = 0x5A;

pub const SOCKS4_REPLY_LEN: usize = 8;
