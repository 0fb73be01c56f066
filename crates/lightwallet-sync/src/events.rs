//! Host-facing sync events
//!
//! Events are broadcast to every subscriber and logged with an `event` field for observability.
//! Progress only ever reports durably committed heights.

use crate::error::ErrorKind;
use crate::state::StopReason;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Sync event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A batch was committed
    Progress {
        /// Highest durably committed height
        scanned_height: u64,
        /// Latest known remote height
        target_height: u64,
    },
    /// An error was observed
    Error {
        /// Error class
        kind: ErrorKind,
        /// Whether the engine will keep going
        recoverable: bool,
        /// Human-readable detail
        detail: String,
    },
    /// Local history diverged from the remote chain and was rewound
    ReorgDetected {
        /// Height where the divergence was detected
        from_height: u64,
        /// Common ancestor the engine rewound to
        to_height: u64,
    },
    /// Every known remote block is committed
    CaughtUp {
        /// Committed height
        height: u64,
    },
    /// The engine stopped
    Stopped {
        /// Why it stopped
        reason: StopReason,
    },
}

/// Broadcast sender for [`SyncEvent`]s.
///
/// Sending never blocks. A subscriber that falls behind by more than the buffer size
/// sees a `Lagged` error and skips ahead.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventSink {
    /// Create a sink buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New subscription; receives events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Log and broadcast `event`
    pub fn emit(&self, event: SyncEvent) {
        match &event {
            SyncEvent::Progress {
                scanned_height,
                target_height,
            } => debug!(
                event = "sync_progress",
                scanned_height = %scanned_height,
                target_height = %target_height,
                "Sync progress"
            ),
            SyncEvent::Error {
                kind,
                recoverable: true,
                detail,
            } => warn!(
                event = "sync_error",
                kind = ?kind,
                recoverable = true,
                detail = %detail,
                "Recoverable sync error"
            ),
            SyncEvent::Error { kind, detail, .. } => error!(
                event = "sync_error",
                kind = ?kind,
                recoverable = false,
                detail = %detail,
                "Fatal sync error"
            ),
            SyncEvent::ReorgDetected {
                from_height,
                to_height,
            } => warn!(
                event = "reorg_detected",
                from_height = %from_height,
                to_height = %to_height,
                "Chain reorganization detected"
            ),
            SyncEvent::CaughtUp { height } => info!(
                event = "sync_caught_up",
                height = %height,
                "Sync caught up"
            ),
            SyncEvent::Stopped { reason } => info!(
                event = "sync_stopped",
                reason = %reason,
                "Sync stopped"
            ),
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}
