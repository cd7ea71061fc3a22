//! Process-wide log multiplexer.
//!
//! Every runtime writes its operational lines to one broadcast channel,
//! tagged with its runtime id, and to its own log file. The control
//! plane's `/logs` WebSocket fans the channel out to dashboards; the log
//! files cover post-hoc inspection after a runtime is gone.

use crate::domain_types::RuntimeId;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};
use tracing::warn;

/// Broadcast capacity; slow subscribers skip lines rather than apply
/// backpressure to runtimes.
const CHANNEL_CAPACITY: usize = 1024;

/// One multiplexed log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    /// Runtime that produced the line.
    pub runtime_id: RuntimeId,
    /// The line itself, without a trailing newline.
    pub line: String,
    /// Whether dashboards should hide it by default.
    pub is_verbose: bool,
}

/// Fan-out hub shared by the supervisor and control plane.
#[derive(Debug, Clone)]
pub struct LogMultiplexer {
    tx: broadcast::Sender<LogLine>,
}

impl Default for LogMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogMultiplexer {
    /// Creates an empty multiplexer.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribes a new consumer. Lines published before this call are not
    /// replayed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }

    /// Creates the per-runtime sink writing to `file_path` and into the
    /// shared channel.
    pub async fn sink(&self, runtime_id: RuntimeId, file_path: PathBuf) -> Arc<LogSink> {
        if let Some(parent) = file_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(dir = %parent.display(), error = %e, "could not create log directory");
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .await
            .map_err(|e| {
                warn!(file = %file_path.display(), error = %e, "could not open runtime log file");
                e
            })
            .ok();
        Arc::new(LogSink {
            runtime_id,
            tx: self.tx.clone(),
            file: Mutex::new(file),
        })
    }
}

/// A runtime's handle into the multiplexer.
#[derive(Debug)]
pub struct LogSink {
    runtime_id: RuntimeId,
    tx: broadcast::Sender<LogLine>,
    file: Mutex<Option<tokio::fs::File>>,
}

impl LogSink {
    /// Publishes an operational line.
    pub async fn log(&self, line: impl Into<String>) {
        self.write(line.into(), false).await;
    }

    /// Publishes a line dashboards hide by default.
    pub async fn verbose(&self, line: impl Into<String>) {
        self.write(line.into(), true).await;
    }

    async fn write(&self, line: String, is_verbose: bool) {
        if let Some(file) = self.file.lock().await.as_mut() {
            let stamped = format!("{} {line}\n", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"));
            if let Err(e) = file.write_all(stamped.as_bytes()).await {
                warn!(error = %e, "runtime log write failed");
            }
        }
        // No subscribers is fine; send only fails when nobody listens.
        let _ = self.tx.send(LogLine {
            runtime_id: self.runtime_id,
            line,
            is_verbose,
        });
    }
}

/// Last `limit` lines of a runtime log file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn tail_file(path: &Path, limit: usize) -> std::io::Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(limit);
    Ok(lines[start..].iter().map(ToString::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn lines_reach_subscribers_with_runtime_tag() {
        let mux = LogMultiplexer::new();
        let mut rx = mux.subscribe();
        let id = RuntimeId::generate();
        let dir = tempdir().unwrap();
        let sink = mux.sink(id, dir.path().join("r.log")).await;

        sink.log("claimed message m1").await;
        sink.verbose("ping ok").await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.runtime_id, id);
        assert_eq!(first.line, "claimed message m1");
        assert!(!first.is_verbose);

        let second = rx.recv().await.unwrap();
        assert!(second.is_verbose);
    }

    #[tokio::test]
    async fn lines_land_in_the_log_file() {
        let mux = LogMultiplexer::new();
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime.log");
        let sink = mux.sink(RuntimeId::generate(), path.clone()).await;

        sink.log("first").await;
        sink.log("second").await;

        let tail = tail_file(&path, 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(tail[0].ends_with("second"));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_does_not_fail() {
        let mux = LogMultiplexer::new();
        let dir = tempdir().unwrap();
        let sink = mux.sink(RuntimeId::generate(), dir.path().join("r.log")).await;
        sink.log("nobody listening").await;
    }
}
