//! Error types for sync operations

use crate::block::BlockHash;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Sync engine errors.
///
/// Every failure the engine can observe is one of these classes. Retryable classes
/// (`TransientNetwork`, non-tip `Continuity`, `Scan`) are handled inside the engine and only
/// surface once their attempt budget is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Timeout, connection failure or malformed response from the chain source
    #[error("Network error after {attempts} attempt(s): {source}")]
    TransientNetwork {
        /// Attempts made before giving up (0 when not yet counted)
        attempts: u32,
        /// Underlying source failure
        #[source]
        source: SourceError,
    },

    /// Fetched range does not extend local history
    #[error("Continuity error: {0}")]
    Continuity(#[from] ContinuityError),

    /// Scan function failed for a block
    #[error("Scan error after {attempts} attempt(s): {source}")]
    Scan {
        /// Attempts made before giving up (0 when not yet counted)
        attempts: u32,
        /// Underlying scan failure
        #[source]
        source: ScanFailure,
    },

    /// Remote chain diverged below the wallet birthday
    #[error(
        "Unrecoverable reorg: no common ancestor between height {from_height} and birthday {birthday_height}"
    )]
    UnrecoverableReorg {
        /// Height at which the divergence was detected
        from_height: u64,
        /// Wallet birthday (rewind floor)
        birthday_height: u64,
    },

    /// Block cache or derived-state store failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Remote rejected a submitted transaction
    #[error("Submission rejected (code {code}): {message}")]
    Submission {
        /// Remote error code
        code: i32,
        /// Remote error message
        message: String,
    },

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Fieldless error classification, carried by events and persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// See [`Error::TransientNetwork`]
    TransientNetwork,
    /// See [`Error::Continuity`]
    Continuity,
    /// See [`Error::Scan`]
    Scan,
    /// See [`Error::UnrecoverableReorg`]
    UnrecoverableReorg,
    /// See [`Error::Persistence`]
    Persistence,
    /// See [`Error::Submission`]
    Submission,
    /// See [`Error::Cancelled`]
    Cancelled,
    /// See [`Error::Config`]
    Config,
}

/// Retry budget an error is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryClass {
    Network,
    Scan,
}

impl Error {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            Self::Continuity(_) => ErrorKind::Continuity,
            Self::Scan { .. } => ErrorKind::Scan,
            Self::UnrecoverableReorg { .. } => ErrorKind::UnrecoverableReorg,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Submission { .. } => ErrorKind::Submission,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the engine retries this class of error on its own
    pub fn is_retryable(&self) -> bool {
        self.retry_class().is_some()
    }

    pub(crate) fn retry_class(&self) -> Option<RetryClass> {
        match self {
            Self::TransientNetwork { .. } => Some(RetryClass::Network),
            Self::Continuity(e) if !e.is_tip_mismatch() => Some(RetryClass::Network),
            Self::Scan { .. } => Some(RetryClass::Scan),
            _ => None,
        }
    }

    /// Convert a retryable error whose budget ran out into its fatal form.
    ///
    /// Non-tip continuity violations are malformed responses and escalate as network errors.
    pub(crate) fn exhausted(self, attempts: u32) -> Self {
        match self {
            Self::TransientNetwork { source, .. } => Self::TransientNetwork { attempts, source },
            Self::Continuity(e) => Self::TransientNetwork {
                attempts,
                source: SourceError::Malformed(e.to_string()),
            },
            Self::Scan { source, .. } => Self::Scan { attempts, source },
            other => other,
        }
    }
}

impl From<SourceError> for Error {
    fn from(source: SourceError) -> Self {
        Self::TransientNetwork {
            attempts: 0,
            source,
        }
    }
}

impl From<ScanFailure> for Error {
    fn from(source: ScanFailure) -> Self {
        Self::Scan {
            attempts: 0,
            source,
        }
    }
}

/// Chain source failures. All of them are transient from the engine's point of view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Call did not complete within the request timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Response did not match the request
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Remote returned an error status
    #[error("remote status: {0}")]
    Status(String),
}

/// Block cache and derived-state store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Write would break the store's height invariants
    #[error("Corrupt store: {0}")]
    Corrupt(String),

    /// Background storage task failed
    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Scan function failure for a specific block
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("scan failed at height {height}: {reason}")]
pub struct ScanFailure {
    /// Height of the block that failed to scan
    pub height: u64,
    /// Scanner-reported reason
    pub reason: String,
}

/// Block continuity errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContinuityError {
    /// Response does not hold exactly one block per requested height.
    #[error("length mismatch. requested [{start}, {end}] ({expected} blocks), received {actual}")]
    LengthMismatch {
        /// Requested start height
        start: u64,
        /// Requested end height
        end: u64,
        /// Expected block count
        expected: u64,
        /// Received block count
        actual: u64,
    },
    /// Height discontinuity.
    #[error(
        "height discontinuity. block with height {height} is not continuous with previous block height {previous_block_height}"
    )]
    HeightDiscontinuity {
        /// Block height
        height: u64,
        /// Previous block height
        previous_block_height: u64,
    },
    /// Hash discontinuity inside the fetched range.
    #[error(
        "hash discontinuity. block prev_hash {prev_hash} with height {height} does not match previous block hash {previous_block_hash}"
    )]
    HashDiscontinuity {
        /// Block height
        height: u64,
        /// Block's previous block hash data
        prev_hash: BlockHash,
        /// Actual previous block hash
        previous_block_hash: BlockHash,
    },
    /// First fetched block does not extend the cached tip.
    #[error(
        "tip mismatch. block prev_hash {prev_hash} with height {height} does not match cached block hash {cached_hash}"
    )]
    TipMismatch {
        /// Height of the first fetched block
        height: u64,
        /// Its previous block hash
        prev_hash: BlockHash,
        /// Hash of the cached block at `height - 1`
        cached_hash: BlockHash,
    },
}

impl ContinuityError {
    /// Whether this violation means the remote chain diverged from local history
    pub fn is_tip_mismatch(&self) -> bool {
        matches!(self, Self::TipMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classes() {
        let timeout = Error::from(SourceError::Timeout(Duration::from_secs(1)));
        assert_eq!(timeout.retry_class(), Some(RetryClass::Network));

        let broken = Error::from(ContinuityError::HeightDiscontinuity {
            height: 12,
            previous_block_height: 10,
        });
        assert_eq!(broken.retry_class(), Some(RetryClass::Network));

        let tip = Error::from(ContinuityError::TipMismatch {
            height: 11,
            prev_hash: BlockHash([1; 32]),
            cached_hash: BlockHash([2; 32]),
        });
        assert!(!tip.is_retryable());

        let scan = Error::from(ScanFailure {
            height: 5,
            reason: "oom".to_string(),
        });
        assert_eq!(scan.retry_class(), Some(RetryClass::Scan));

        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::Persistence(StoreError::Corrupt("x".into())).is_retryable());
    }

    #[test]
    fn test_exhausted_continuity_becomes_network() {
        let err = Error::from(ContinuityError::LengthMismatch {
            start: 1,
            end: 3,
            expected: 3,
            actual: 2,
        })
        .exhausted(4);

        match err {
            Error::TransientNetwork { attempts, source } => {
                assert_eq!(attempts, 4);
                assert!(matches!(source, SourceError::Malformed(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_error_kind() {
        let err = Error::Submission {
            code: -25,
            message: "bad-txns".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Submission);
        assert!(err.to_string().contains("bad-txns"));
    }
}
