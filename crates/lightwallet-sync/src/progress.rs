//! Committed-height progress for the sync run, plus per-batch counters.
//!
//! Everything here is updated only after a batch is durable, so readers never
//! see a height the store could lose.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Point-in-time copy of the batch counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchCountersSnapshot {
    /// Batches durably committed
    pub batches_committed: u64,
    /// Wallet transactions found in those batches
    pub transactions_detected: u64,
    /// Wall time of the most recent batch, fetch through commit
    pub last_batch_ms: u64,
    /// Mean over `batches_committed`
    pub avg_batch_ms: u64,
    /// Reorg rewinds since the run started
    pub rewinds: u64,
}

/// Shared progress handle. Clones observe the same run.
#[derive(Debug, Clone, Default)]
pub struct SyncProgress {
    run: Arc<RwLock<Run>>,
}

/// Heights for one run of the engine
#[derive(Debug, Clone, Default)]
struct Run {
    origin: u64,
    committed: u64,
    target: u64,
    began: Option<Instant>,
    rate: Rate,
    counters: Counters,
}

/// Throughput measured from blocks actually committed
#[derive(Debug, Clone, Copy, Default)]
struct Rate {
    blocks: u64,
    per_second: f64,
    eta: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    batches: u64,
    transactions: u64,
    last_ms: u64,
    total_ms: u64,
    rewinds: u64,
}

impl Run {
    fn remaining(&self) -> u64 {
        self.target.saturating_sub(self.committed)
    }

    fn refresh_rate(&mut self) {
        let Some(began) = self.began else {
            return;
        };
        let secs = began.elapsed().as_secs_f64();
        if self.rate.blocks == 0 || secs <= 0.0 {
            return;
        }
        self.rate.per_second = self.rate.blocks as f64 / secs;
        if self.rate.per_second > 0.0 {
            self.rate.eta = Some((self.remaining() as f64 / self.rate.per_second) as u64);
        }
    }
}

impl SyncProgress {
    /// Tracker with no run started
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset counters and begin timing a run whose first committed height is `height`.
    ///
    /// A target set before the run started is kept unless it is below `height`.
    pub fn start(&self, height: u64) {
        let mut run = self.run.write();
        let target = run.target.max(height);
        *run = Run {
            origin: height,
            committed: height,
            target,
            began: Some(Instant::now()),
            ..Run::default()
        };
    }

    /// Latest remote height the run is heading for
    pub fn set_target(&self, height: u64) {
        self.run.write().target = height;
    }

    /// A batch ending at `height` is durable.
    pub fn record_commit(&self, height: u64, transactions: u64, duration: Duration) {
        let mut run = self.run.write();
        let advanced = height.saturating_sub(run.committed);
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

        run.committed = height;
        if run.target < height {
            run.target = height;
        }
        run.rate.blocks += advanced;
        run.counters.batches += 1;
        run.counters.transactions += transactions;
        run.counters.last_ms = ms;
        run.counters.total_ms = run.counters.total_ms.saturating_add(ms);
        run.refresh_rate();
    }

    /// The wallet was rewound to `height` after a reorg.
    pub fn record_rewind(&self, height: u64) {
        let mut run = self.run.write();
        run.committed = height;
        run.counters.rewinds += 1;
    }

    /// Share of this run's span already committed, 0 to 100.
    pub fn percentage(&self) -> f64 {
        let run = self.run.read();
        if run.target == 0 {
            0.0
        } else if run.committed >= run.target {
            100.0
        } else if run.target <= run.origin {
            0.0
        } else {
            let span = (run.target - run.origin) as f64;
            run.committed.saturating_sub(run.origin) as f64 / span * 100.0
        }
    }

    /// Highest committed height
    pub fn current_height(&self) -> u64 {
        self.run.read().committed
    }

    /// Height the run is heading for
    pub fn target_height(&self) -> u64 {
        self.run.read().target
    }

    /// `None` until at least one block has been committed in this run
    pub fn eta_seconds(&self) -> Option<u64> {
        self.run.read().rate.eta
    }

    /// Committed blocks per second since `start`
    pub fn blocks_per_second(&self) -> f64 {
        self.run.read().rate.per_second
    }

    /// Time since `start`, if a run began
    pub fn elapsed(&self) -> Option<Duration> {
        self.run.read().began.map(|began| began.elapsed())
    }

    /// Snapshot of the batch counters
    pub fn counters(&self) -> BatchCountersSnapshot {
        let counters = self.run.read().counters;
        BatchCountersSnapshot {
            batches_committed: counters.batches,
            transactions_detected: counters.transactions,
            last_batch_ms: counters.last_ms,
            avg_batch_ms: counters.total_ms.checked_div(counters.batches).unwrap_or(0),
            rewinds: counters.rewinds,
        }
    }

    /// Whether committed height has reached a non-zero target
    pub fn is_complete(&self) -> bool {
        let run = self.run.read();
        run.target > 0 && run.committed >= run.target
    }

    /// One-line status for logs, e.g. `height 150 of 200 (50.0%), 12.5 blk/s, 4s left`
    pub fn summary(&self) -> String {
        let percent = self.percentage();
        let run = self.run.read();
        let left = match (run.remaining(), run.rate.eta) {
            (0, _) => "synced".to_string(),
            (_, Some(secs)) if secs >= 60 => format!("{}m{:02}s left", secs / 60, secs % 60),
            (_, Some(secs)) => format!("{secs}s left"),
            (_, None) => "rate unknown".to_string(),
        };
        format!(
            "height {} of {} ({percent:.1}%), {:.1} blk/s, {left}",
            run.committed, run.target, run.rate.per_second
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tracker_is_empty() {
        let progress = SyncProgress::new();
        assert_eq!(progress.current_height(), 0);
        assert_eq!(progress.target_height(), 0);
        assert_eq!(progress.eta_seconds(), None);
        assert!(progress.elapsed().is_none());
        assert!(!progress.is_complete());
        assert_eq!(progress.counters(), BatchCountersSnapshot::default());
    }

    #[test]
    fn test_percentage_measures_this_run_only() {
        let progress = SyncProgress::new();
        progress.start(100);
        progress.set_target(200);
        assert_eq!(progress.percentage(), 0.0);

        progress.record_commit(150, 0, Duration::from_millis(5));
        assert!((progress.percentage() - 50.0).abs() < 1e-9);

        progress.record_commit(200, 0, Duration::from_millis(5));
        assert_eq!(progress.percentage(), 100.0);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_start_keeps_a_higher_target_and_clears_counters() {
        let progress = SyncProgress::new();
        progress.set_target(300);
        progress.start(0);
        progress.record_commit(10, 4, Duration::from_millis(8));

        progress.start(10);
        assert_eq!(progress.target_height(), 300);
        assert_eq!(progress.current_height(), 10);
        assert_eq!(progress.counters(), BatchCountersSnapshot::default());

        progress.start(400);
        assert_eq!(progress.target_height(), 400);
    }

    #[test]
    fn test_commits_and_rewinds_feed_counters() {
        let progress = SyncProgress::new();
        progress.start(0);
        progress.set_target(30);
        progress.record_commit(10, 2, Duration::from_millis(10));
        progress.record_commit(20, 1, Duration::from_millis(30));
        progress.record_rewind(15);

        assert_eq!(
            progress.counters(),
            BatchCountersSnapshot {
                batches_committed: 2,
                transactions_detected: 3,
                last_batch_ms: 30,
                avg_batch_ms: 20,
                rewinds: 1,
            }
        );
        assert_eq!(progress.current_height(), 15);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_commit_past_target_raises_it() {
        let progress = SyncProgress::new();
        progress.start(0);
        progress.set_target(10);
        progress.record_commit(12, 0, Duration::ZERO);
        assert_eq!(progress.target_height(), 12);
        assert!(progress.is_complete());
    }

    #[test]
    fn test_summary_reports_heights() {
        let progress = SyncProgress::new();
        progress.start(500);
        progress.set_target(1000);
        let line = progress.summary();
        assert!(line.starts_with("height 500 of 1000"));
        assert!(line.ends_with("rate unknown"));

        progress.record_commit(1000, 0, Duration::from_millis(1));
        assert!(progress.summary().ends_with("synced"));
    }
}
