//! Backward walk for the common ancestor after a divergence.

/// Heights to check when looking for the last block local history shares with the remote.
///
/// Starts `step` below the mismatching height and walks down by `step`. The birthday is always the
/// last candidate: a walk never goes below it, and never further than `max_depth` below the
/// mismatch when a depth limit is set.
#[derive(Debug, Clone)]
pub struct AncestorSearch {
    next: Option<u64>,
    step: u64,
    floor: u64,
}

impl AncestorSearch {
    /// Walk down from `mismatch_height` (exclusive) towards `birthday_height`
    pub fn new(
        mismatch_height: u64,
        birthday_height: u64,
        step: u64,
        max_depth: Option<u64>,
    ) -> Self {
        let step = step.max(1);
        let floor = match max_depth {
            Some(depth) => mismatch_height.saturating_sub(depth).max(birthday_height),
            None => birthday_height,
        };
        let next = if mismatch_height > floor {
            Some(mismatch_height.saturating_sub(step).max(floor))
        } else {
            None
        };
        Self { next, step, floor }
    }

    /// Lowest height this walk will check
    pub fn floor(&self) -> u64 {
        self.floor
    }
}

impl Iterator for AncestorSearch {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let current = self.next?;
        self.next = if current > self.floor {
            Some(current.saturating_sub(self.step).max(self.floor))
        } else {
            None
        };
        Some(current)
    }
}
