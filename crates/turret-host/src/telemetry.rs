//! Telemetry snapshots.
//!
//! One publisher task samples the whole system at 2 Hz and broadcasts
//! read-only snapshots; the operator socket and any future transports
//! subscribe. Errors carry a monotonically increasing sequence number so
//! clients can deduplicate across snapshots.

use laser::{LaserSafetyController, LaserState};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;
use tracking::{TrackerTelemetry, TrackingController};

/// Snapshot cadence (2 Hz).
pub const SNAPSHOT_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub seq: u64,
    pub message: String,
}

/// Last-error feed with per-record sequence numbers.
#[derive(Default)]
pub struct ErrorLog {
    seq: AtomicU64,
    last: Mutex<Option<ErrorReport>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: impl Into<String>) {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        *self.last.lock() = Some(ErrorReport {
            seq,
            message: message.into(),
        });
    }

    pub fn last(&self) -> Option<ErrorReport> {
        self.last.lock().clone()
    }
}

/// The full read-only view broadcast to clients.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub tracker: TrackerTelemetry,
    pub laser: LaserState,
    pub last_error: Option<ErrorReport>,
}

/// Builds one snapshot, folding any motion error the mover recorded since
/// the last call into the sequenced log.
pub fn snapshot(
    tracker: &TrackingController,
    laser: &LaserSafetyController,
    errors: &ErrorLog,
) -> TelemetrySnapshot {
    if let Some(message) = tracker.take_last_error() {
        errors.record(message);
    }
    TelemetrySnapshot {
        tracker: tracker.telemetry(),
        laser: laser.status(),
        last_error: errors.last(),
    }
}

/// Spawns the 2 Hz publisher. The returned sender hands out subscriptions.
pub fn spawn_publisher(
    tracker: Arc<TrackingController>,
    laser: Arc<LaserSafetyController>,
    errors: Arc<ErrorLog>,
) -> broadcast::Sender<TelemetrySnapshot> {
    let (tx, _) = broadcast::channel(16);
    let publisher = tx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SNAPSHOT_PERIOD);
        loop {
            ticker.tick().await;
            let snap = snapshot(&tracker, &laser, &errors);
            if publisher.send(snap).is_err() {
                trace!("telemetry snapshot dropped, no subscribers");
            }
        }
    });
    tx
}
