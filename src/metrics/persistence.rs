//! Snapshotting performance history to disk
//!
//! History is loaded once at startup and written out periodically by a
//! background task. Writes go to a sibling temp file that is then renamed
//! over the target, so a crash mid-write never leaves a truncated snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{OutcomeEvent, PerformanceTracker};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid snapshot: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

/// On-disk form of the tracker's history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    pub nodes: BTreeMap<String, Vec<OutcomeEvent>>,
}

impl MetricsSnapshot {
    pub fn capture(tracker: &PerformanceTracker) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            nodes: tracker.export_history().into_iter().collect(),
        }
    }

    pub fn event_count(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write the tracker's history to `path`. Returns the number of events written.
pub fn save_snapshot(tracker: &PerformanceTracker, path: &Path) -> Result<usize, PersistenceError> {
    let snapshot = MetricsSnapshot::capture(tracker);
    let json = serde_json::to_vec_pretty(&snapshot)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;

    Ok(snapshot.event_count())
}

/// Restore history from `path` into the tracker. A missing file restores nothing.
pub fn load_snapshot(tracker: &PerformanceTracker, path: &Path) -> Result<usize, PersistenceError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let snapshot: MetricsSnapshot = serde_json::from_slice(&content)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(PersistenceError::UnsupportedVersion(snapshot.version));
    }

    let count = snapshot.event_count();
    tracker.import_history(snapshot.nodes.into_iter().collect());
    Ok(count)
}

/// Periodically snapshot the tracker until shutdown, then write one final snapshot.
pub fn spawn_snapshotter(
    tracker: Arc<PerformanceTracker>,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting metrics snapshotter: path={}, interval={}s",
            path.display(),
            interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match save_snapshot(&tracker, &path) {
                        Ok(count) => debug!("Snapshotted {} outcome events", count),
                        Err(e) => warn!("Metrics snapshot to {} failed: {}", path.display(), e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = save_snapshot(&tracker, &path) {
            warn!("Final metrics snapshot to {} failed: {}", path.display(), e);
        }
        info!("Metrics snapshotter stopped");
    })
}
