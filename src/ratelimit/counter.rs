//! Sliding window counter shared by every request handler.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{Clock, MonotonicClock};
use super::window::{Decision, RateLimitState, WindowLimit};
use crate::error::{Result, TurnstileError};

/// Default upper bound on the number of tracked keys.
pub const DEFAULT_MAX_KEYS: usize = 100_000;

/// Fraction of `max_keys` freed by one eviction pass.
const EVICTION_BATCH_DIVISOR: usize = 100;

/// Per-key sliding window admission control.
///
/// State lives in a sharded map: a check locks only the shard holding its key
/// for the whole purge-count-append sequence, so checks on the same key are
/// serialized while checks on keys in other shards run in parallel.
///
/// The number of tracked keys is bounded. When a new key arrives at capacity,
/// one eviction pass frees a batch of about 1% of `max_keys`: keys whose
/// events have all expired go first, then the least recently seen keys. The
/// pass visits one shard at a time, so the full-map walk is paid once per
/// batch rather than once per new key, and checks on other shards keep going
/// while it runs. Only one caller evicts at a time; others insert without
/// waiting, so racing inserts may overshoot the bound briefly.
pub struct SlidingWindowCounter {
    states: DashMap<String, RateLimitState>,
    max_keys: usize,
    eviction_batch: usize,
    evicting: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowCounter {
    /// Create a counter on the monotonic clock with the default key bound.
    pub fn new() -> Self {
        Self::with_clock(DEFAULT_MAX_KEYS, Arc::new(MonotonicClock))
    }

    /// Create a counter that tracks at most `max_keys` keys.
    pub fn with_max_keys(max_keys: usize) -> Self {
        Self::with_clock(max_keys, Arc::new(MonotonicClock))
    }

    /// Create a counter reading time from `clock`.
    pub fn with_clock(max_keys: usize, clock: Arc<dyn Clock>) -> Self {
        let max_keys = max_keys.max(1);
        Self {
            states: DashMap::new(),
            max_keys,
            eviction_batch: (max_keys / EVICTION_BATCH_DIVISOR).max(1),
            evicting: Mutex::new(()),
            clock,
        }
    }

    /// Admit one event for `key` now.
    pub fn admit(&self, key: &str, limit: &WindowLimit) -> Result<bool> {
        self.admit_at(key, self.clock.now(), limit)
    }

    /// Admit one event for `key` at `now`.
    ///
    /// Returns `true` and records the event if fewer than `limit` events were
    /// admitted in `(now - window, now]`; otherwise returns `false` and leaves
    /// the record unchanged.
    pub fn admit_at(&self, key: &str, now: Instant, limit: &WindowLimit) -> Result<bool> {
        Ok(self.check_at(key, now, limit, 1)?.admitted)
    }

    /// Admit `hits` events for `key` now.
    pub fn check(&self, key: &str, limit: &WindowLimit, hits: u64) -> Result<Decision> {
        self.check_at(key, self.clock.now(), limit, hits)
    }

    /// Admit `hits` events for `key` at `now`, all or none.
    pub fn check_at(
        &self,
        key: &str,
        now: Instant,
        limit: &WindowLimit,
        hits: u64,
    ) -> Result<Decision> {
        if key.is_empty() {
            return Err(TurnstileError::EmptyKey);
        }

        trace!(key = %key, hits = hits, limit = limit.limit(), "Checking sliding window");

        if let Some(mut state) = self.states.get_mut(key) {
            return Ok(state.check(now, limit, hits));
        }

        // Must run before `entry` takes a shard lock: eviction walks every shard.
        if self.states.len() >= self.max_keys {
            self.make_room(now);
        }

        let mut state = self.states.entry(key.to_string()).or_insert_with(|| {
            debug!(
                key = %key,
                limit = limit.limit(),
                window = ?limit.window(),
                "Creating new sliding window"
            );
            RateLimitState::new(now)
        });
        Ok(state.check(now, limit, hits))
    }

    /// Remaining quota for `key` at `now` without recording anything.
    ///
    /// Unknown keys report the full limit.
    pub fn remaining_at(&self, key: &str, now: Instant, limit: &WindowLimit) -> u64 {
        self.states
            .get(key)
            .map(|state| state.remaining(now, limit))
            .unwrap_or(limit.limit())
    }

    /// Number of events recorded for `key`, including any not yet purged.
    pub fn recorded(&self, key: &str) -> Option<u64> {
        self.states.get(key).map(|state| state.count())
    }

    /// Drop every key whose events have all left their window.
    ///
    /// Returns the number of keys removed.
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| !state.is_expired(now));
        before.saturating_sub(self.states.len())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.states.clear();
    }

    fn make_room(&self, now: Instant) {
        let Some(_evicting) = self.evicting.try_lock() else {
            return;
        };
        if self.states.len() < self.max_keys {
            return;
        }

        let batch = self.eviction_batch;
        let mut expired = Vec::new();
        // Max-heap on last_seen holding the `batch` least recently seen keys.
        let mut idle: BinaryHeap<(Instant, String)> = BinaryHeap::with_capacity(batch + 1);

        for entry in self.states.iter() {
            let state = entry.value();
            if state.is_expired(now) {
                expired.push(entry.key().clone());
                continue;
            }
            let seen = state.last_seen();
            if idle.len() < batch {
                idle.push((seen, entry.key().clone()));
            } else if idle.peek().is_some_and(|(newest, _)| seen < *newest) {
                idle.pop();
                idle.push((seen, entry.key().clone()));
            }
        }

        let mut evicted = 0;
        for key in &expired {
            if self.states.remove_if(key, |_, state| state.is_expired(now)).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted expired sliding windows");
        }

        let mut dropped = 0;
        for (seen, key) in idle.into_sorted_vec() {
            if evicted + dropped >= batch {
                break;
            }
            // Skip keys checked again since the walk.
            if self.states.remove_if(&key, |_, state| state.last_seen() == seen).is_some() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(evicted = dropped, "Evicted least recently seen sliding windows");
        }
    }
}

impl Default for SlidingWindowCounter {
    fn default() -> Self {
        Self::new()
    }
}
