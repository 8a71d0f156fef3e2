//! SOCKS4 Protocol Handler

use super::{Socks4Reply, Socks4Request, UserIdMode};
use crate::protocol::constants::*;
use crate::Result;
use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS4 CONNECT negotiation for a freshly accepted client stream
pub struct Socks4Handler<S> {
    stream: S,
    user_id_mode: UserIdMode,
}

impl<S> Socks4Handler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new SOCKS4 handler for the given stream
    pub fn new(stream: S, user_id_mode: UserIdMode) -> Self {
        Self {
            stream,
            user_id_mode,
        }
    }

    /// Read and validate the CONNECT request, then grant it.
    ///
    /// A malformed request is rejected without writing any reply; the caller
    /// drops the connection.
    pub async fn negotiate(&mut self) -> Result<Socks4Request> {
        let request = self.read_request().await?;

        debug!(
            destination = %request.destination(),
            user_id_len = request.user_id.len(),
            "SOCKS4 CONNECT request received"
        );

        self.send_reply(Socks4Reply::granted()).await?;

        Ok(request)
    }

    /// Read the request according to the configured USERID convention
    async fn read_request(&mut self) -> Result<Socks4Request> {
        match self.user_id_mode {
            UserIdMode::Fixed => {
                let mut buf = [0u8; SOCKS4_FIXED_REQUEST_LEN];
                self.stream.read_exact(&mut buf).await
                    .map_err(|e| anyhow!("Failed to read SOCKS4 request: {}", e))?;

                let mut header = [0u8; SOCKS4_REQUEST_HEADER_LEN];
                header.copy_from_slice(&buf[..SOCKS4_REQUEST_HEADER_LEN]);
                let mut request = Socks4Request::from_header(&header);
                Self::validate(&request)?;

                let user_id = buf[SOCKS4_REQUEST_HEADER_LEN];
                if user_id != 0 {
                    request.user_id.push(user_id);
                }
                Ok(request)
            }
            UserIdMode::NullTerminated => {
                let mut header = [0u8; SOCKS4_REQUEST_HEADER_LEN];
                self.stream.read_exact(&mut header).await
                    .map_err(|e| anyhow!("Failed to read SOCKS4 request header: {}", e))?;

                let mut request = Socks4Request::from_header(&header);
                Self::validate(&request)?;

                request.user_id = self.read_user_id().await?;
                Ok(request)
            }
        }
    }

    /// Read USERID up to its NUL terminator
    async fn read_user_id(&mut self) -> Result<Vec<u8>> {
        let mut user_id = Vec::new();
        loop {
            let byte = self.stream.read_u8().await
                .map_err(|e| anyhow!("Failed to read SOCKS4 user id: {}", e))?;
            if byte == 0 {
                return Ok(user_id);
            }
            user_id.push(byte);
            if user_id.len() >= SOCKS4_MAX_USER_ID_LEN {
                return Err(anyhow!(
                    "SOCKS4 user id exceeds {} bytes without terminator",
                    SOCKS4_MAX_USER_ID_LEN
                ));
            }
        }
    }

    fn validate(request: &Socks4Request) -> Result<()> {
        if request.version != SOCKS4_VERSION {
            return Err(anyhow!("Unsupported SOCKS version: {}", request.version));
        }

        if request.command != SOCKS4_CMD_CONNECT {
            return Err(anyhow!("Unsupported SOCKS4 command: {}", request.command));
        }

        Ok(())
    }

    /// Send reply to client
    async fn send_reply(&mut self, reply: Socks4Reply) -> Result<()> {
        self.stream.write_all(&reply.to_bytes()).await
            .map_err(|e| anyhow!("Failed to send SOCKS4 reply: {}", e))?;
        self.stream.flush().await
            .map_err(|e| anyhow!("Failed to flush SOCKS4 reply: {}", e))?;
        Ok(())
    }

    /// Get the underlying stream back for relaying
    pub fn into_stream(self) -> S {
        self.stream
    }
}
