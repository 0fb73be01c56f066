//! Engine-owned sync state.
//!
//! `SyncState` is a plain serializable value. Every transition consumes the current value and
//! returns the next one, so the engine never mutates it in place and the exact value that was
//! committed alongside a batch can be persisted with it.

use crate::block::BlockHash;
use crate::error::{Error, ErrorKind};
use crate::scan::ScanState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the engine stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Host requested cancellation
    Cancelled,
    /// Fatal error; requires an explicit restart
    Fatal {
        /// Error class
        kind: ErrorKind,
        /// Human-readable detail
        detail: String,
    },
}

impl StopReason {
    /// Stop reason for an error that ended a run
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Cancelled => Self::Cancelled,
            other => Self::Fatal {
                kind: other.kind(),
                detail: other.to_string(),
            },
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::Fatal { kind, detail } => write!(f, "{:?}: {}", kind, detail),
        }
    }
}

/// State machine phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Resting; initial and recurring
    Idle,
    /// Waiting for a block range from the remote
    FetchingRange,
    /// Checking the fetched range against local history
    Validating,
    /// Running the scanner over the batch
    Scanning,
    /// Writing the batch and advancing the high-water mark
    Persisting,
    /// Walking back to a common ancestor after a divergence
    RecoveringReorg,
    /// Terminal until the host restarts the engine
    Stopped(StopReason),
}

impl SyncPhase {
    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::FetchingRange => "Fetching Range",
            Self::Validating => "Validating",
            Self::Scanning => "Scanning",
            Self::Persisting => "Persisting",
            Self::RecoveringReorg => "Recovering Reorg",
            Self::Stopped(_) => "Stopped",
        }
    }

    /// Whether this is the terminal phase
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

/// Last error observed by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Error class
    pub kind: ErrorKind,
    /// Human-readable detail
    pub detail: String,
    /// Whether the engine kept going after it
    pub recoverable: bool,
}

/// Wallet birthday: the floor for every rewind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Birthday {
    /// Height below which the wallet has no history
    pub height: u64,
    /// Hash of the block at `height`, when known from a checkpoint
    pub hash: Option<BlockHash>,
    /// Scanning state as of `height`
    #[serde(default)]
    pub initial_state: ScanState,
}

impl Birthday {
    /// Birthday without a known anchor hash
    pub fn new(height: u64) -> Self {
        Self {
            height,
            hash: None,
            initial_state: ScanState::default(),
        }
    }

    /// Birthday anchored to a known block hash
    pub fn with_hash(height: u64, hash: BlockHash) -> Self {
        Self {
            height,
            hash: Some(hash),
            initial_state: ScanState::default(),
        }
    }

    /// Set the scanning state at the birthday height
    pub fn with_initial_state(mut self, state: ScanState) -> Self {
        self.initial_state = state;
        self
    }
}

/// Sync state owned by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Latest height reported by the remote
    pub latest_known_remote_height: u64,
    /// High-water mark: highest durably committed height
    pub highest_scanned_height: u64,
    /// Wallet birthday height
    pub birthday_height: u64,
    /// Current phase
    pub phase: SyncPhase,
    /// Last error, if any
    pub last_error: Option<ErrorRecord>,
}

impl SyncState {
    /// State at wallet initialization: resume from the persisted high-water mark, or the
    /// birthday when nothing was persisted.
    pub fn initial(birthday_height: u64, persisted_high_water_mark: Option<u64>) -> Self {
        let highest = persisted_high_water_mark
            .unwrap_or(birthday_height)
            .max(birthday_height);
        Self {
            latest_known_remote_height: highest,
            highest_scanned_height: highest,
            birthday_height,
            phase: SyncPhase::Idle,
            last_error: None,
        }
    }

    /// Enter `phase`
    pub fn with_phase(mut self, phase: SyncPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Record the latest remote height
    pub fn observe_remote(mut self, height: u64) -> Self {
        self.latest_known_remote_height = height;
        self
    }

    /// Advance the high-water mark after a durable commit. Never moves it backwards.
    pub fn advance(mut self, height: u64) -> Self {
        self.highest_scanned_height = self.highest_scanned_height.max(height);
        self.latest_known_remote_height = self.latest_known_remote_height.max(height);
        self.last_error = None;
        self
    }

    /// Move the high-water mark back to `height`, clamped to the birthday
    pub fn rewind(mut self, height: u64) -> Self {
        self.highest_scanned_height = height.max(self.birthday_height);
        self
    }

    /// Take `height` as the committed high-water mark as persisted, in either direction
    pub fn resume_at(mut self, height: u64) -> Self {
        self.highest_scanned_height = height.max(self.birthday_height);
        self.latest_known_remote_height = self
            .latest_known_remote_height
            .max(self.highest_scanned_height);
        self
    }

    /// Record an error
    pub fn record_error(mut self, error: &Error, recoverable: bool) -> Self {
        self.last_error = Some(ErrorRecord {
            kind: error.kind(),
            detail: error.to_string(),
            recoverable,
        });
        self
    }

    /// Next height the planner will request
    pub fn next_height(&self) -> u64 {
        self.highest_scanned_height + 1
    }

}
