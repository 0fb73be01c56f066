//! Range planner

use crate::block::ScanRange;

/// Next range to fetch, or `None` when there is no work.
///
/// The batch is the smaller of `max_batch_size` and the distance to the remote tip, starting
/// right above the high-water mark.
pub fn plan_next_range(
    highest_scanned_height: u64,
    latest_remote_height: u64,
    max_batch_size: u64,
) -> Option<ScanRange> {
    if latest_remote_height <= highest_scanned_height || max_batch_size == 0 {
        return None;
    }

    let start = highest_scanned_height + 1;
    let remaining = latest_remote_height - highest_scanned_height;
    let end = start + remaining.min(max_batch_size) - 1;
    ScanRange::new(start, end)
}

/// Number of ranges needed to reach the tip
pub fn batches_remaining(
    highest_scanned_height: u64,
    latest_remote_height: u64,
    max_batch_size: u64,
) -> u64 {
    if max_batch_size == 0 {
        return 0;
    }
    latest_remote_height
        .saturating_sub(highest_scanned_height)
        .div_ceil(max_batch_size)
}
