//! Light wallet block synchronization engine
//!
//! Incrementally fetches compact block summaries from a remote chain source, validates that they
//! extend local history, scans them for wallet activity and persists the results, rewinding to a
//! common ancestor when the remote chain reorganizes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod block;
pub mod block_cache;
pub mod client;
pub mod continuity;
pub mod control;
mod db;
pub mod error;
pub mod events;
pub mod memory;
pub mod planner;
pub mod progress;
pub mod reorg;
pub mod retry;
pub mod scan;
pub mod state;
pub mod store;
pub mod sync;

pub use block::{BlockHash, BlockSummary, ScanRange, BLOCK_HASH_LEN};
pub use block_cache::{BlockCache, SqliteBlockCache};
pub use client::{compute_txid, ChainSource, SubmissionResult, SubmittedTransaction};
pub use control::{CancelToken, PauseGate};
pub use error::{ContinuityError, Error, ErrorKind, Result, ScanFailure, SourceError, StoreError};
pub use events::{EventSink, SyncEvent};
pub use progress::{BatchCountersSnapshot, SyncProgress};
pub use retry::{Backoff, RetryConfig};
pub use scan::{BlockScanner, DetectedTransaction, ScanOutput, ScanState, ScannedBatch};
pub use state::{Birthday, ErrorRecord, StopReason, SyncPhase, SyncState};
pub use store::{CommitBatch, CommittedView, DerivedStateStore, SqliteDerivedStore};
pub use sync::{SyncConfig, SyncEngine, SyncHandle};
