//! Retry budgets with exponential backoff

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for network operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts (including the first) before a failure becomes fatal
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Randomize each delay by ±20%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Same curve with a different attempt budget
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self.clone()
        }
    }
}

/// Failure counter for one class of operation.
///
/// Each failure either yields the delay to wait before retrying, or `None` once the attempt
/// budget is spent. `reset` drops back to the base delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
    next: Duration,
}

impl Backoff {
    /// Fresh backoff at the base delay
    pub fn new(config: RetryConfig) -> Self {
        let next = config.initial_backoff;
        Self {
            config,
            failures: 0,
            next,
        }
    }

    /// Failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure. Returns the delay before the next attempt, or `None` when the budget
    /// is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.config.max_attempts {
            return None;
        }

        let delay = self.next.min(self.config.max_backoff);
        self.next = std::cmp::min(
            Duration::from_millis(
                (self.next.as_millis() as f64 * self.config.backoff_multiplier) as u64,
            ),
            self.config.max_backoff,
        );

        Some(if self.config.jitter {
            jitter_duration(delay).min(self.config.max_backoff)
        } else {
            delay
        })
    }

    /// Back to the base delay with a full budget
    pub fn reset(&mut self) {
        self.failures = 0;
        self.next = self.config.initial_backoff;
    }
}

fn jitter_duration(duration: Duration) -> Duration {
    let millis = duration.as_millis() as u64;
    if millis == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    let jittered = (millis as f64 * jitter) as u64;
    Duration::from_millis(jittered.max(1))
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
