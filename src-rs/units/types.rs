use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inclusive range of milliseconds a randomized delay is drawn from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange { min_ms: 0, max_ms: 0 };

    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn sample(&self) -> Duration {
        let (lo, hi) = if self.min_ms <= self.max_ms {
            (self.min_ms, self.max_ms)
        } else {
            (self.max_ms, self.min_ms)
        };
        if lo == hi {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunnerConfig {
    /// Units processed per session before it is recycled.
    pub batch_size: usize,
    /// Attempts per unit within one pass.
    pub max_attempts: u32,
    /// Pause between consecutive units.
    pub unit_delay: DelayRange,
    /// Wait before refreshing after a challenge.
    pub challenge_backoff: DelayRange,
    /// Wait after a transport or delivery error.
    pub error_backoff: DelayRange,
    /// Idle time after warm-up of a fresh session.
    pub warmup_delay: DelayRange,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 45,
            max_attempts: 3,
            unit_delay: DelayRange::new(500, 1500),
            challenge_backoff: DelayRange::new(2000, 4000),
            error_backoff: DelayRange::new(1000, 2000),
            warmup_delay: DelayRange::new(2000, 4000),
        }
    }
}

impl RunnerConfig {
    /// Default limits with every delay removed.
    pub fn without_delays() -> Self {
        Self {
            unit_delay: DelayRange::ZERO,
            challenge_backoff: DelayRange::ZERO,
            error_backoff: DelayRange::ZERO,
            warmup_delay: DelayRange::ZERO,
            ..Self::default()
        }
    }

    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        if self.max_attempts == 0 {
            self.max_attempts = defaults.max_attempts;
        }
        self
    }
}

/// One item a job processes: one URL, one artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkUnit {
    pub index: usize,
    pub url: String,
}

impl WorkUnit {
    pub fn new(index: usize, url: impl Into<String>) -> Self {
        Self {
            index,
            url: url.into(),
        }
    }

    pub fn from_urls<I, S>(urls: I) -> Vec<WorkUnit>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        urls.into_iter()
            .enumerate()
            .map(|(index, url)| WorkUnit::new(index, url))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Challenged { marker: String },
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded { attempts: u32 },
    Failed { attempts: u32, reason: String },
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Succeeded { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    #[default]
    First,
    Retry,
}

/// Saved after every unit so a resumed job skips what it already handled.
///
/// `next_index` is a position in the unit list during the first pass and a
/// position in `failed` during the retry pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerCursor {
    pub pass: Pass,
    pub next_index: usize,
    pub failed: Vec<usize>,
    pub still_failed: Vec<usize>,
}

impl RunnerCursor {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
