//! Sliding window state for a single rate limit key.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Calendar unit used to express a window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }

    /// Convert from the Envoy proto enum value.
    pub fn from_proto(unit: i32) -> Option<Self> {
        match unit {
            1 => Some(TimeUnit::Second),
            2 => Some(TimeUnit::Minute),
            3 => Some(TimeUnit::Hour),
            4 => Some(TimeUnit::Day),
            _ => None,
        }
    }

    /// Convert to the Envoy proto enum value.
    pub fn to_proto(&self) -> i32 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 2,
            TimeUnit::Hour => 3,
            TimeUnit::Day => 4,
        }
    }
}

/// A validated `(limit, window)` pair.
///
/// Both values are strictly positive; a zero in either would mean "admit
/// nothing" or "admit everything" and is rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    limit: u64,
    window: Duration,
}

impl WindowLimit {
    /// Create a limit of `limit` events per trailing `window`.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::Config(
                "rate limit must allow at least one request".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "rate limit window must be longer than zero".to_string(),
            ));
        }
        Ok(Self { limit, window })
    }

    /// Create a limit of `limit` events per `multiplier` units of time.
    pub fn per_unit(limit: u64, unit: TimeUnit, multiplier: u32) -> Result<Self> {
        if multiplier == 0 {
            return Err(TurnstileError::Config(
                "unit_multiplier must be at least 1".to_string(),
            ));
        }
        Self::new(limit, unit.duration() * multiplier)
    }

    /// Multiply the allowed event count, keeping the window.
    pub fn scaled(&self, factor: u64) -> Result<Self> {
        Self::new(self.limit.saturating_mul(factor), self.window)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// The calendar unit this window corresponds to, if it is exactly one unit long.
    pub fn unit(&self) -> Option<TimeUnit> {
        [TimeUnit::Second, TimeUnit::Minute, TimeUnit::Hour, TimeUnit::Day]
            .into_iter()
            .find(|unit| unit.duration() == self.window)
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the events were admitted and recorded
    pub admitted: bool,
    /// The limit the check ran against
    pub limit: u64,
    /// Events still admissible in the current window
    pub remaining: u64,
    /// Time until the oldest retained event leaves the window
    pub reset_after: Duration,
}

impl Decision {
    /// Retry hint in whole seconds, rounded up and never below one.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        let secs = if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        secs.max(1)
    }
}

/// Events recorded at one instant.
#[derive(Debug, Clone, Copy)]
struct Run {
    at: Instant,
    count: u64,
}

/// Timestamps of admitted events for one key, oldest first.
///
/// Events admitted at the same instant are stored as a single run, so a burst
/// of `n` hits costs one slot instead of `n`.
#[derive(Debug)]
pub struct RateLimitState {
    runs: VecDeque<Run>,
    total: u64,
    window: Duration,
    last_seen: Instant,
}

impl RateLimitState {
    /// Create an empty record first observed at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            runs: VecDeque::new(),
            total: 0,
            window: Duration::ZERO,
            last_seen: now,
        }
    }

    /// Drop every event with `t <= now - window`.
    ///
    /// Events stamped after `now` (a caller clock that stepped backwards) are
    /// treated as age zero and kept.
    pub fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(&Run { at, count }) = self.runs.front() {
            if now.saturating_duration_since(at) < window {
                break;
            }
            self.total -= count;
            self.runs.pop_front();
        }
    }

    /// Purge, then admit `hits` events if they all fit under the limit.
    ///
    /// A rejected check leaves the recorded events untouched. `hits == 0`
    /// reports the current state without recording anything.
    pub fn check(&mut self, now: Instant, limit: &WindowLimit, hits: u64) -> Decision {
        self.window = limit.window();
        self.last_seen = self.last_seen.max(now);
        self.purge(now, limit.window());

        let admitted = self.total.saturating_add(hits) <= limit.limit();
        if admitted && hits > 0 {
            self.record(now, hits);
        }

        Decision {
            admitted,
            limit: limit.limit(),
            remaining: limit.limit().saturating_sub(self.total),
            reset_after: self.reset_after(now, limit.window()),
        }
    }

    /// Remaining quota at `now` without mutating the record.
    pub fn remaining(&self, now: Instant, limit: &WindowLimit) -> u64 {
        let in_window: u64 = self
            .runs
            .iter()
            .filter(|run| now.saturating_duration_since(run.at) < limit.window())
            .map(|run| run.count)
            .sum();
        limit.limit().saturating_sub(in_window)
    }

    /// Number of events currently recorded.
    pub fn count(&self) -> u64 {
        self.total
    }

    /// Whether every recorded event has left the window of the last check.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.runs.back() {
            Some(newest) => now.saturating_duration_since(newest.at) >= self.window,
            None => true,
        }
    }

    /// The latest instant this key was checked.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    fn record(&mut self, now: Instant, hits: u64) {
        // Keep the record sorted even if `now` went backwards.
        let at = match self.runs.back() {
            Some(newest) if newest.at > now => newest.at,
            _ => now,
        };

        match self.runs.back_mut() {
            Some(newest) if newest.at == at => newest.count += hits,
            _ => self.runs.push_back(Run { at, count: hits }),
        }
        self.total += hits;
    }

    fn reset_after(&self, now: Instant, window: Duration) -> Duration {
        match self.runs.front() {
            Some(oldest) => window.saturating_sub(now.saturating_duration_since(oldest.at)),
            None => Duration::ZERO,
        }
    }
}
