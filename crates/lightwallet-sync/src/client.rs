//! Chain source contract
//!
//! The engine talks to the remote full-node proxy only through [`ChainSource`]:
//! - Query the latest block height
//! - Fetch compact block summaries in an inclusive range
//! - Submit a raw transaction
//!
//! Every call is bounded by a deadline and raced against the cancellation token, so a stalled
//! remote produces the same transient error as a dropped connection.

use crate::block::{BlockSummary, ScanRange};
use crate::control::CancelToken;
use crate::error::SourceError;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Remote chain source
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Current chain tip height
    async fn latest_height(&self) -> std::result::Result<u64, SourceError>;

    /// Block summaries for `range`, ascending, one per height
    async fn fetch_range(
        &self,
        range: ScanRange,
    ) -> std::result::Result<Vec<BlockSummary>, SourceError>;

    /// Broadcast a raw transaction
    async fn submit(&self, raw_tx: Vec<u8>) -> std::result::Result<SubmissionResult, SourceError>;
}

#[async_trait]
impl<T: ChainSource + ?Sized> ChainSource for Arc<T> {
    async fn latest_height(&self) -> std::result::Result<u64, SourceError> {
        (**self).latest_height().await
    }

    async fn fetch_range(
        &self,
        range: ScanRange,
    ) -> std::result::Result<Vec<BlockSummary>, SourceError> {
        (**self).fetch_range(range).await
    }

    async fn submit(&self, raw_tx: Vec<u8>) -> std::result::Result<SubmissionResult, SourceError> {
        (**self).submit(raw_tx).await
    }
}

/// Transaction broadcast result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    /// Error code (0 = success)
    pub code: i32,
    /// Error message (empty on success)
    pub message: String,
}

impl SubmissionResult {
    /// Accepted by the remote
    pub fn accepted() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    /// Whether the remote accepted the transaction
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Accepted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransaction {
    /// Transaction ID (hex string)
    pub txid: String,
    /// Remote response
    pub result: SubmissionResult,
}

/// Run one source call under `timeout`, aborting if `cancel` fires first.
pub(crate) async fn call_with_deadline<T, F>(
    fut: F,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<T>
where
    F: Future<Output = std::result::Result<T, SourceError>>,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    tokio::select! {
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SourceError::Timeout(timeout).into()),
        },
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// Submit `raw_tx` once. Never retried: a rejection surfaces as [`Error::Submission`] with the
/// remote-reported reason, a network failure as [`Error::TransientNetwork`].
pub async fn submit_transaction(
    source: &dyn ChainSource,
    raw_tx: Vec<u8>,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<SubmittedTransaction> {
    tracing::info!("Broadcasting transaction ({} bytes)", raw_tx.len());
    let txid = compute_txid(&raw_tx);

    let result = call_with_deadline(source.submit(raw_tx), timeout, cancel).await?;
    if !result.is_success() {
        tracing::error!(
            "Transaction broadcast failed: code={}, message={}",
            result.code,
            result.message
        );
        return Err(Error::Submission {
            code: result.code,
            message: result.message,
        });
    }

    tracing::info!("Transaction broadcast successful: {}", txid);
    Ok(SubmittedTransaction { txid, result })
}

/// Compute transaction ID from raw transaction bytes
pub fn compute_txid(raw_tx: &[u8]) -> String {
    // Double SHA256 of the tx, displayed byte-reversed
    let first = Sha256::digest(raw_tx);
    let mut second = Sha256::digest(first).to_vec();
    second.reverse();
    hex::encode(second)
}
