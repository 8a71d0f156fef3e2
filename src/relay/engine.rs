//! Relay Engine

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::counter::{ByteObserver, Direction};
use crate::Result;

/// Default relay buffer size (32 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// How a single copy direction came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Source reached end-of-stream; carries bytes written
    Eof(u64),
    /// The session scope was cancelled before end-of-stream
    Cancelled(u64),
}

impl CopyOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            CopyOutcome::Eof(bytes) | CopyOutcome::Cancelled(bytes) => *bytes,
        }
    }
}

/// Bytes written in each direction of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Dials destinations and relays data between client and remote connections
#[derive(Debug, Clone)]
pub struct RelayEngine {
    connect_timeout: Duration,
    buffer_size: usize,
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayEngine {
    /// Create a new relay engine
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Create a new relay engine with custom dial timeout and buffer size
    pub fn with_settings(connect_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            connect_timeout,
            buffer_size,
        }
    }

    /// Create a new relay engine from configuration
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::with_settings(config.server.connect_timeout, config.server.buffer_size)
    }

    /// Dial the destination (`host:port`, hostnames resolved by tokio)
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        debug!("Connecting to remote {}", addr);

        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                // Relay writes are forwarded as they arrive
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
                Ok(stream)
            }
            Ok(Err(e)) => Err(anyhow!("Failed to connect to {}: {}", addr, e)),
            Err(_) => Err(anyhow!(
                "Connection to {} timed out after {:?}",
                addr,
                self.connect_timeout
            )),
        }
    }

    /// Relay data bidirectionally until both directions have finished.
    ///
    /// Each direction runs in its own task under a scope derived from
    /// `shutdown`. A failing direction cancels the scope, which stops the
    /// sibling before its next read; a read or write already blocked is not
    /// interrupted and finishes when the peer closes or sends data. Both
    /// connections are closed once the two tasks have returned.
    pub async fn relay<C, R>(
        &self,
        shutdown: &CancellationToken,
        client: C,
        remote: R,
        up: Arc<dyn ByteObserver>,
        down: Arc<dyn ByteObserver>,
    ) -> Result<RelayStats>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        R: AsyncRead + AsyncWrite + Send + 'static,
    {
        let scope = shutdown.child_token();
        let (client_read, client_write) = tokio::io::split(client);
        let (remote_read, remote_write) = tokio::io::split(remote);

        let upstream = spawn_direction(
            Direction::Up,
            scope.clone(),
            client_read,
            remote_write,
            self.buffer_size,
            up,
        );
        let downstream = spawn_direction(
            Direction::Down,
            scope.clone(),
            remote_read,
            client_write,
            self.buffer_size,
            down,
        );

        let (upstream, downstream) = tokio::join!(upstream, downstream);
        let upstream = upstream.context("client -> remote task failed")?;
        let downstream = downstream.context("remote -> client task failed")?;

        let up = upstream?;
        let down = downstream?;

        if matches!(up, CopyOutcome::Cancelled(_)) || matches!(down, CopyOutcome::Cancelled(_)) {
            info!("Relay stopped by shutdown");
        }

        Ok(RelayStats {
            bytes_up: up.bytes(),
            bytes_down: down.bytes(),
        })
    }
}

fn spawn_direction<R, W>(
    direction: Direction,
    scope: CancellationToken,
    src: R,
    dst: W,
    buffer_size: usize,
    observer: Arc<dyn ByteObserver>,
) -> tokio::task::JoinHandle<Result<CopyOutcome>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = copy_direction(&scope, src, dst, buffer_size, observer.as_ref()).await;
        match &result {
            Ok(outcome) => debug!("{} finished: {:?}", direction, outcome),
            Err(e) => {
                debug!("{} failed: {:#}", direction, e);
                scope.cancel();
            }
        }
        // Both halves are dropped here; the connection closes once the
        // sibling has dropped its halves too.
        result.with_context(|| format!("{}", direction))
    })
}

/// Copy `src` into `dst` until end-of-stream, error, or cancellation.
///
/// The observer sees exactly the byte count every `write` reported, in
/// write order. A partial write is followed by another `write` of the
/// remainder; a write that accepts zero bytes is an error.
/// On end-of-stream the write side of `dst` is shut down so the peer sees
/// the half-close.
pub async fn copy_direction<R, W>(
    scope: &CancellationToken,
    mut src: R,
    mut dst: W,
    buffer_size: usize,
    observer: &dyn ByteObserver,
) -> Result<CopyOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total: u64 = 0;

    while !scope.is_cancelled() {
        let read = src.read(&mut buf).await.context("read")?;
        if read == 0 {
            if let Err(e) = dst.shutdown().await {
                debug!("Failed to propagate end-of-stream: {}", e);
            }
            return Ok(CopyOutcome::Eof(total));
        }

        if scope.is_cancelled() {
            break;
        }

        // A partial write is backpressure; keep writing the rest of the chunk.
        let mut offset = 0;
        while offset < read {
            let written = dst.write(&buf[offset..read]).await.context("write")?;
            if written == 0 {
                bail!("short write: {} of {} bytes written", offset, read);
            }
            observer.observe(written as u64);
            total += written as u64;
            offset += written;
        }
    }

    Ok(CopyOutcome::Cancelled(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::ByteCounter;
    use std::io;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_copy_reports_every_write() {
        let src = Builder::new().read(b"hello ").read(b"world").build();
        let dst = Builder::new().write(b"hello ").write(b"world").build();
        let counter = ByteCounter::new();

        let outcome = copy_direction(&CancellationToken::new(), src, dst, 1024, &counter)
            .await
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Eof(11));
        assert_eq!(counter.drain(), 11);
    }

    /// Records every observation in order
    #[derive(Default)]
    struct Recorder(std::sync::Mutex<Vec<u64>>);

    impl ByteObserver for Recorder {
        fn observe(&self, bytes: u64) {
            self.0.lock().unwrap().push(bytes);
        }
    }

    /// Writer that accepts nothing
    struct ZeroWriter;

    impl AsyncWrite for ZeroWriter {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Ok(0))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_partial_write_continues_with_remainder() {
        let src = Builder::new().read(b"abcdef").build();
        let dst = Builder::new().write(b"abc").write(b"def").build();
        let recorder = Recorder::default();

        let outcome = copy_direction(&CancellationToken::new(), src, dst, 1024, &recorder)
            .await
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Eof(6));
        assert_eq!(*recorder.0.lock().unwrap(), vec![3, 3]);
    }

    #[tokio::test]
    async fn test_zero_byte_write_is_fatal() {
        let src = Builder::new().read(b"abcdef").build();
        let counter = ByteCounter::new();

        let err = copy_direction(&CancellationToken::new(), src, ZeroWriter, 1024, &counter)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("short write: 0 of 6 bytes written"));
        assert_eq!(counter.drain(), 0);
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let src = Builder::new()
            .read(b"ok")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let dst = Builder::new().write(b"ok").build();
        let counter = ByteCounter::new();

        let err = copy_direction(&CancellationToken::new(), src, dst, 1024, &counter)
            .await
            .unwrap_err();

        assert_eq!(format!("{}", err), "read");
        assert_eq!(counter.drain(), 2);
    }

    #[tokio::test]
    async fn test_write_error_is_reported() {
        let src = Builder::new().read(b"data").build();
        let dst = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let counter = ByteCounter::new();

        let err = copy_direction(&CancellationToken::new(), src, dst, 1024, &counter)
            .await
            .unwrap_err();

        assert_eq!(format!("{}", err), "write");
        assert_eq!(counter.drain(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_scope_starts_no_new_work() {
        let scope = CancellationToken::new();
        scope.cancel();
        let src = Builder::new().build();
        let dst = Builder::new().build();
        let counter = ByteCounter::new();

        let outcome = copy_direction(&scope, src, dst, 1024, &counter).await.unwrap();

        assert_eq!(outcome, CopyOutcome::Cancelled(0));
    }

    #[tokio::test]
    async fn test_buffer_size_bounds_each_write() {
        let src = Builder::new().read(b"abcdefgh").build();
        let dst = Builder::new().write(b"abc").write(b"def").write(b"gh").build();
        let counter = ByteCounter::new();

        let outcome = copy_direction(&CancellationToken::new(), src, dst, 3, &counter)
            .await
            .unwrap();

        assert_eq!(outcome, CopyOutcome::Eof(8));
    }

    #[tokio::test]
    async fn test_relay_counts_both_directions() {
        let (mut client, client_side) = duplex(1024);
        let (remote_side, mut remote) = duplex(1024);
        let up = Arc::new(ByteCounter::new());
        let down = Arc::new(ByteCounter::new());
        let engine = RelayEngine::new();
        let shutdown = CancellationToken::new();

        let relay = {
            let (up, down) = (up.clone(), down.clone());
            tokio::spawn(async move {
                engine
                    .relay(&shutdown, client_side, remote_side, up, down)
                    .await
            })
        };

        client.write_all(b"ping from client").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping from client");

        remote.write_all(b"pong").await.unwrap();
        remote.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"pong");

        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { bytes_up: 16, bytes_down: 4 });
        assert_eq!(up.drain(), 16);
        assert_eq!(down.drain(), 4);
    }

    #[tokio::test]
    async fn test_relay_surfaces_direction_error() {
        let client = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let remote = Builder::new().build();
        let engine = RelayEngine::new();

        let err = engine
            .relay(
                &CancellationToken::new(),
                client,
                remote,
                Arc::new(ByteCounter::new()),
                Arc::new(ByteCounter::new()),
            )
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("client -> remote: read"));
    }

    #[tokio::test]
    async fn test_connect_failure_reports_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RelayEngine::new().connect(&addr).await.unwrap_err();
        assert!(err.to_string().contains(&addr));
    }
}
