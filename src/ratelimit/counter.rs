//! Counter store shared by the window-based limiters.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::clock::SharedClock;
use super::partition::PartitionKey;

/// A snapshot of one partition's counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests observed in the current window
    pub count: u64,
    /// When the current window started
    pub window_start: Instant,
    /// When the current window ends
    pub expires_at: Instant,
}

impl CounterEntry {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            window_start: now,
            expires_at: now + window,
        }
    }

    /// Whether the window has elapsed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time remaining until the window resets.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Concurrent partition key to counter map with per-entry expiry.
///
/// Updates lock only the shard holding the key, so unrelated partitions
/// never contend. Expired entries are replaced on the next access; the
/// periodic sweep only reclaims memory.
pub struct CounterStore {
    entries: DashMap<PartitionKey, CounterEntry>,
    clock: SharedClock,
}

impl CounterStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Atomically count one request against `key`.
    ///
    /// Starts a new window of length `window` when the key is absent or its
    /// window has elapsed; otherwise increments the count and keeps the
    /// existing expiry. Returns the entry as it is after the increment.
    pub fn increment_and_get(&self, key: &PartitionKey, window: Duration) -> CounterEntry {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CounterEntry {
                count: 0,
                window_start: now,
                expires_at: now + window,
            });

        if entry.is_expired(now) {
            *entry = CounterEntry::fresh(now, window);
        } else {
            entry.count += 1;
        }

        trace!(key = %key, count = entry.count, "Counter incremented");
        *entry
    }

    /// Inspect the live entry for `key` without mutating it.
    pub fn peek(&self, key: &PartitionKey) -> Option<CounterEntry> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .map(|entry| *entry)
            .filter(|entry| !entry.is_expired(now))
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked partitions, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}
