//! Scanner interface and sequential batch scanning
//!
//! The scanner itself is opaque to the engine: a deterministic function from a block summary
//! and the prior scanning state to the next state plus whatever it detected. The engine only
//! guarantees ordering (ascending heights, one block at a time) and that a failed or cancelled
//! batch leaves nothing behind.

use crate::block::{BlockSummary, ScanRange};
use crate::control::CancelToken;
use crate::error::ScanFailure;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Opaque scanning state threaded from block to block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanState {
    /// Scanner-defined encoding
    #[serde(with = "crate::block::hex_bytes")]
    pub bytes: Vec<u8>,
}

impl ScanState {
    /// Wrap scanner-encoded bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

/// A transaction the scanner attributed to the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedTransaction {
    /// Height of the containing block
    pub height: u64,
    /// Position inside the block
    pub index: u32,
    /// Transaction id
    pub txid: [u8; 32],
    /// Scanner-defined data (decrypted notes, memo, ...)
    #[serde(with = "crate::block::hex_bytes")]
    pub data: Vec<u8>,
}

/// Result of scanning one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutput {
    /// State after this block
    pub state: ScanState,
    /// Transactions detected in this block
    pub transactions: Vec<DetectedTransaction>,
}

/// Note-scanning routine.
///
/// Implementations must be deterministic: the same block and prior state always yield the same
/// output. A crash can force a range to be scanned again.
pub trait BlockScanner: Send + Sync {
    /// Scan one block
    fn scan_block(
        &self,
        block: &BlockSummary,
        state: &ScanState,
    ) -> std::result::Result<ScanOutput, ScanFailure>;
}

/// Output of a fully scanned batch, ready to commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedBatch {
    /// Range that was scanned
    pub range: ScanRange,
    /// State after each block, ascending
    pub states: Vec<(u64, ScanState)>,
    /// Every transaction detected in the range, ascending by height
    pub transactions: Vec<DetectedTransaction>,
}

/// Scan `blocks` in order starting from `prior`.
///
/// Cancellation is observed between blocks. Nothing is returned for a failed or cancelled
/// batch.
pub fn scan_batch(
    scanner: &dyn BlockScanner,
    range: ScanRange,
    blocks: &[BlockSummary],
    prior: &ScanState,
    cancel: &CancelToken,
) -> Result<ScannedBatch> {
    let mut states = Vec::with_capacity(blocks.len());
    let mut transactions = Vec::new();
    let mut state = prior.clone();

    for block in blocks {
        if cancel.is_cancelled() {
            tracing::debug!(height = block.height, "Scan cancelled mid-batch");
            return Err(Error::Cancelled);
        }

        let output = scanner.scan_block(block, &state)?;
        transactions.extend(output.transactions);
        state = output.state;
        states.push((block.height, state.clone()));
    }

    Ok(ScannedBatch {
        range,
        states,
        transactions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockHash;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingScanner {
        calls: AtomicUsize,
        fail_at: Option<u64>,
        cancel_at: Option<(u64, CancelToken)>,
    }

    impl BlockScanner for CountingScanner {
        fn scan_block(
            &self,
            block: &BlockSummary,
            state: &ScanState,
        ) -> std::result::Result<ScanOutput, ScanFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(block.height) {
                return Err(ScanFailure {
                    height: block.height,
                    reason: "boom".to_string(),
                });
            }
            if let Some((height, token)) = &self.cancel_at {
                if *height == block.height {
                    token.cancel();
                }
            }
            let mut bytes = state.bytes.clone();
            bytes.push(block.height as u8);
            Ok(ScanOutput {
                state: ScanState::new(bytes),
                transactions: vec![DetectedTransaction {
                    height: block.height,
                    index: 0,
                    txid: [block.height as u8; 32],
                    data: vec![],
                }],
            })
        }
    }

    fn blocks(range: ScanRange) -> Vec<BlockSummary> {
        range
            .heights()
            .map(|height| BlockSummary {
                height,
                hash: BlockHash([height as u8; 32]),
                prev_hash: BlockHash([height.wrapping_sub(1) as u8; 32]),
                time: 0,
                payload: vec![],
            })
            .collect()
    }

    fn scanner() -> CountingScanner {
        CountingScanner {
            calls: AtomicUsize::new(0),
            fail_at: None,
            cancel_at: None,
        }
    }

    #[test]
    fn test_scan_batch_threads_state() {
        let range = ScanRange::new(1, 3).unwrap();
        let batch = scan_batch(
            &scanner(),
            range,
            &blocks(range),
            &ScanState::default(),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(batch.states.len(), 3);
        assert_eq!(batch.states.last().unwrap(), &(3, ScanState { bytes: vec![1, 2, 3] }));
        assert_eq!(batch.transactions.len(), 3);
    }

    #[test]
    fn test_scan_batch_failure_discards_batch() {
        let range = ScanRange::new(1, 5).unwrap();
        let mut failing = scanner();
        failing.fail_at = Some(3);

        let result = scan_batch(
            &failing,
            range,
            &blocks(range),
            &ScanState::default(),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(Error::Scan { .. })));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_scan_batch_observes_cancellation_between_blocks() {
        let range = ScanRange::new(1, 10).unwrap();
        let token = CancelToken::new();
        let mut cancelling = scanner();
        cancelling.cancel_at = Some((4, token.clone()));

        let result = scan_batch(
            &cancelling,
            range,
            &blocks(range),
            &ScanState::default(),
            &token,
        );
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(cancelling.calls.load(Ordering::SeqCst), 4);
    }
}
