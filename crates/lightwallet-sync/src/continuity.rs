//! Fetched-range validation.
//!
//! A fetched range is accepted only if it holds exactly one block per requested height,
//! ascending, each linked to the previous by hash, and its first block links to the cached
//! block right below the range (the anchor) when one is known.

use crate::block::{BlockHash, BlockSummary, ScanRange};
use crate::error::ContinuityError;

/// Check `blocks` against the requested `range` and the hash of the block at
/// `range.start - 1`.
///
/// Only an anchor mismatch yields [`ContinuityError::TipMismatch`]; every other variant means the
/// response itself is malformed.
pub fn validate_range(
    range: ScanRange,
    blocks: &[BlockSummary],
    anchor: Option<&BlockHash>,
) -> Result<(), ContinuityError> {
    if blocks.len() as u64 != range.len() {
        return Err(ContinuityError::LengthMismatch {
            start: range.start,
            end: range.end,
            expected: range.len(),
            actual: blocks.len() as u64,
        });
    }

    let mut prev_height = range.start.checked_sub(1);
    let mut prev_hash: Option<BlockHash> = None;

    for block in blocks {
        let expected_height = prev_height.map_or(range.start, |h| h + 1);
        if block.height != expected_height {
            return Err(ContinuityError::HeightDiscontinuity {
                height: block.height,
                previous_block_height: expected_height.saturating_sub(1),
            });
        }

        match prev_hash {
            Some(prev_hash) if block.prev_hash != prev_hash => {
                return Err(ContinuityError::HashDiscontinuity {
                    height: block.height,
                    prev_hash: block.prev_hash,
                    previous_block_hash: prev_hash,
                });
            }
            Some(_) => {}
            None => {
                if let Some(anchor) = anchor {
                    if block.prev_hash != *anchor {
                        return Err(ContinuityError::TipMismatch {
                            height: block.height,
                            prev_hash: block.prev_hash,
                            cached_hash: *anchor,
                        });
                    }
                }
            }
        }

        prev_height = Some(block.height);
        prev_hash = Some(block.hash);
    }

    Ok(())
}

/// Check that an already-stored run of blocks is hash-linked, returning the first height
/// that breaks the chain.
pub fn first_break(blocks: &[BlockSummary]) -> Option<u64> {
    blocks
        .windows(2)
        .find(|pair| !pair[1].extends(&pair[0]))
        .map(|pair| pair[1].height)
}
