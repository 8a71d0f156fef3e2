//! Persisted Telemetry Log

use std::path::Path;

use anyhow::Context;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TelemetrySnapshot;
use crate::Result;

/// Timestamp layout of each log line, UTC
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Format a snapshot as `<timestamp>: <bytes>\n`
pub fn format_line(snapshot: &TelemetrySnapshot) -> String {
    format!(
        "{}: {}\n",
        snapshot.taken_at.format(LOG_TIMESTAMP_FORMAT),
        snapshot.bytes
    )
}

/// Open `path` for appending, creating it owner-readable only
pub async fn open_log_file(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    options.mode(0o600);

    options
        .open(path)
        .await
        .with_context(|| format!("open log file: {}", path.display()))
}

/// Appends one line per nonzero snapshot to a writer
pub struct LogSink<W> {
    writer: W,
}

impl<W> LogSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write snapshots until shutdown or until the feed closes, then hand
    /// the writer back.
    pub async fn run(
        mut self,
        mut snapshots: broadcast::Receiver<TelemetrySnapshot>,
        shutdown: CancellationToken,
    ) -> Result<W> {
        info!("Telemetry log sink started");

        loop {
            let snapshot = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = snapshots.recv() => match received {
                    Ok(snapshot) => snapshot,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Telemetry log sink fell behind, {} snapshots skipped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            if snapshot.bytes == 0 {
                continue;
            }

            self.writer
                .write_all(format_line(&snapshot).as_bytes())
                .await
                .context("write telemetry log line")?;
            self.writer
                .flush()
                .await
                .context("flush telemetry log")?;
        }

        debug!("Telemetry log sink stopped");
        Ok(self.writer)
    }
}
