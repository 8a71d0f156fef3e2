//! Telemetry HTTP Server
//!
//! Serves the dashboard page, the `/data` push stream of drained byte counts,
//! and Prometheus metrics.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, Sse},
        Html, IntoResponse, Response,
    },
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use super::{EmitPolicy, RelayMetrics, TelemetrySnapshot};
use crate::Result;

const DASHBOARD: &str = include_str!("dashboard.html");

/// Shared state for telemetry handlers
#[derive(Clone)]
pub struct TelemetryState {
    pub feed: broadcast::Sender<TelemetrySnapshot>,
    pub emit: EmitPolicy,
    pub metrics: Arc<RelayMetrics>,
    pub shutdown: CancellationToken,
}

/// HTTP endpoint for the telemetry feed
pub struct TelemetryServer {
    listener: TcpListener,
    state: TelemetryState,
}

impl TelemetryServer {
    /// Bind the telemetry listener
    pub async fn bind(bind_addr: SocketAddr, state: TelemetryState) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind telemetry server to {}", bind_addr))?;

        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown token is cancelled.
    ///
    /// Open push streams end on the same token, so the graceful shutdown
    /// does not wait on them.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.state.shutdown.clone();
        info!("Telemetry server listening on {}", self.local_addr()?);

        let app = create_router(self.state);
        if let Err(e) = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            error!("Telemetry server error: {}", e);
            return Err(e).context("Telemetry server failed");
        }

        info!("Telemetry server shutdown complete");
        Ok(())
    }
}

/// Create the telemetry router
pub fn create_router(state: TelemetryState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/data", get(stream_data))
        .route("/health", get(health_check))
        .route("/metrics", get(export_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn export_metrics(State(state): State<TelemetryState>) -> Response {
    match state.metrics.export_prometheus() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to export metrics: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /data`: one `data: <bytes>` event per emitted snapshot
async fn stream_data(State(state): State<TelemetryState>) -> impl IntoResponse {
    let snapshots = state.feed.subscribe();
    let (events, stream) = mpsc::channel(16);

    tokio::spawn(forward_snapshots(snapshots, events, state.emit, state.shutdown.clone()));

    (
        [(header::CONTENT_DISPOSITION, "inline")],
        Sse::new(ReceiverStream::new(stream)),
    )
}

/// Feed one subscriber until it disconnects or the server shuts down
async fn forward_snapshots(
    mut snapshots: broadcast::Receiver<TelemetrySnapshot>,
    events: mpsc::Sender<std::result::Result<Event, Infallible>>,
    emit: EmitPolicy,
    shutdown: CancellationToken,
) {
    debug!("Push stream subscriber connected");

    loop {
        let snapshot = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = events.closed() => break,
            received = snapshots.recv() => match received {
                Ok(snapshot) => snapshot,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Push stream subscriber lagged, {} snapshots skipped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if !emit.should_emit(snapshot.bytes) {
            continue;
        }

        let event = Event::default().data(snapshot.bytes.to_string());
        if events.send(Ok(event)).await.is_err() {
            break;
        }
    }

    debug!("Push stream subscriber disconnected");
}
