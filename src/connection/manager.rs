//! Connection Manager Implementation

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, DestinationMode};
use crate::counter::{ByteObserver, Direction, NullObserver, Tee};
use crate::protocol::Socks4Handler;
use crate::relay::{RelayEngine, RelaySession};
use crate::telemetry::{RelayMetrics, SessionStage};
use crate::Result;

/// Observers every session reports its writes to, one per direction
#[derive(Clone)]
pub struct Observers {
    pub up: Arc<dyn ByteObserver>,
    pub down: Arc<dyn ByteObserver>,
}

impl Observers {
    pub fn new(up: Arc<dyn ByteObserver>, down: Arc<dyn ByteObserver>) -> Self {
        Self { up, down }
    }

    /// Same observer for both directions
    pub fn both(observer: Arc<dyn ByteObserver>) -> Self {
        Self {
            up: Arc::clone(&observer),
            down: observer,
        }
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self::both(Arc::new(NullObserver))
    }
}

/// Count of sessions still running
#[derive(Debug, Clone, Default)]
pub struct ActiveSessions(Arc<AtomicUsize>);

impl ActiveSessions {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn enter(&self) -> SessionGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        SessionGuard(self.clone())
    }
}

struct SessionGuard(ActiveSessions);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        (self.0).0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything a session task needs, shared by all sessions
struct SessionContext {
    destination: DestinationMode,
    relay_engine: RelayEngine,
    handshake_timeout: Duration,
    observers: Observers,
    metrics: Arc<RelayMetrics>,
    shutdown: CancellationToken,
}

/// Owns the relay listener and spawns one session per accepted connection
pub struct ConnectionManager {
    listener: TcpListener,
    context: Arc<SessionContext>,
    active_sessions: ActiveSessions,
    shutdown_timeout: Duration,
}

impl ConnectionManager {
    /// Bind the relay listener
    pub async fn bind(
        config: &Config,
        observers: Observers,
        metrics: Arc<RelayMetrics>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let bind_addr = config.server.bind_addr;

        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("start listening on {}", bind_addr))?;
        info!("Successfully bound to {}", listener.local_addr()?);

        let context = SessionContext {
            destination: config.destination.clone(),
            relay_engine: RelayEngine::from_config(config),
            handshake_timeout: config.server.handshake_timeout,
            observers,
            metrics,
            shutdown,
        };

        Ok(Self {
            listener,
            context: Arc::new(context),
            active_sessions: ActiveSessions::default(),
            shutdown_timeout: config.server.shutdown_timeout,
        })
    }

    /// Bind and accept until shutdown or a listener failure
    pub async fn start(
        config: &Config,
        observers: Observers,
        metrics: Arc<RelayMetrics>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        Self::bind(config, observers, metrics, shutdown).await?.run().await
    }

    /// Get the bound listener address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the running-session count, usable after `run` takes `self`
    pub fn active_sessions(&self) -> ActiveSessions {
        self.active_sessions.clone()
    }

    /// Main connection acceptance loop.
    ///
    /// An accept error is fatal and returned. On shutdown the listener is
    /// closed, then in-flight sessions get up to `shutdown_timeout` to
    /// finish on their own.
    pub async fn run(self) -> Result<()> {
        info!("Starting connection acceptance loop");

        loop {
            tokio::select! {
                _ = self.context.shutdown.cancelled() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.context("accept connection")?;
                    debug!("Accepted connection from {}", peer);
                    self.spawn_session(stream, peer);
                }
            }
        }

        drop(self.listener);
        info!("Connection acceptance loop stopped");

        Self::wait_for_sessions_to_close(&self.active_sessions, self.shutdown_timeout).await;
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let context = Arc::clone(&self.context);
        let guard = self.active_sessions.enter();

        tokio::spawn(async move {
            let _guard = guard;
            context.metrics.session_opened();

            match Self::handle_session(&context, stream, peer).await {
                Ok(()) => debug!("Session from {} finished", peer),
                Err(e) => warn!("Session from {} ended with error: {:#}", peer, e),
            }

            context.metrics.session_closed();
        });
    }

    /// Resolve the destination, dial it, and relay until both directions end
    #[instrument(skip_all, fields(peer = %peer))]
    async fn handle_session(
        context: &SessionContext,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let destination = match &context.destination {
            DestinationMode::Static { addr } => addr.clone(),
            DestinationMode::Socks4 { user_id } => {
                let mut handler = Socks4Handler::new(&mut stream, *user_id);
                let negotiated = timeout(context.handshake_timeout, handler.negotiate()).await;
                match negotiated {
                    Ok(Ok(request)) => request.destination().to_string(),
                    Ok(Err(e)) => {
                        context.metrics.session_failed(SessionStage::Handshake);
                        return Err(e.context("SOCKS4 handshake failed"));
                    }
                    Err(_) => {
                        context.metrics.session_failed(SessionStage::Handshake);
                        return Err(anyhow!(
                            "SOCKS4 handshake timed out after {:?}",
                            context.handshake_timeout
                        ));
                    }
                }
            }
        };

        let remote = match context.relay_engine.connect(&destination).await {
            Ok(remote) => remote,
            Err(e) => {
                context.metrics.session_failed(SessionStage::Dial);
                return Err(e.context("connect to server"));
            }
        };

        let session = Arc::new(RelaySession::new(peer, destination));
        info!(session_id = %session.session_id, "Relaying {} -> {}", peer, session.destination);

        let up: Arc<dyn ByteObserver> = Arc::new(Tee::new(vec![
            Arc::clone(&context.observers.up),
            session.observer(Direction::Up),
        ]));
        let down: Arc<dyn ByteObserver> = Arc::new(Tee::new(vec![
            Arc::clone(&context.observers.down),
            session.observer(Direction::Down),
        ]));

        let result = context
            .relay_engine
            .relay(&context.shutdown, stream, remote, up, down)
            .await;

        session.log_stats();

        if let Err(e) = result {
            context.metrics.session_failed(SessionStage::Relay);
            return Err(e.context(format!("session {}", session.session_id)));
        }

        Ok(())
    }

    /// Wait for running sessions to finish, bounded by `shutdown_timeout`
    async fn wait_for_sessions_to_close(active: &ActiveSessions, shutdown_timeout: Duration) {
        let start_time = Instant::now();

        if active.count() > 0 {
            info!(
                "Waiting for {} active sessions to close (timeout: {:?})",
                active.count(),
                shutdown_timeout
            );
        }

        while active.count() > 0 && start_time.elapsed() < shutdown_timeout {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = active.count();
        if remaining == 0 {
            info!("All sessions closed in {:?}", start_time.elapsed());
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} sessions still active",
                start_time.elapsed(),
                remaining
            );
        }
    }
}
