//! Fixed window limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::clock::SharedClock;
use super::counter::CounterStore;
use super::limiter::{format_seconds, Algorithm, Limiter};
use super::partition::PartitionKey;
use super::verdict::LimiterOutcome;
use crate::error::Result;

/// Counts requests in contiguous, non-overlapping windows.
///
/// A window opens on the first request of a partition. Up to twice the
/// permit limit can pass across a window boundary.
pub struct FixedWindowLimiter {
    store: Arc<CounterStore>,
    clock: SharedClock,
    permit_limit: u64,
    window: Duration,
}

impl FixedWindowLimiter {
    /// Create a limiter with its own counter store.
    pub fn new(clock: SharedClock, permit_limit: u64, window: Duration) -> Self {
        let store = Arc::new(CounterStore::new(clock.clone()));
        Self::with_store(store, clock, permit_limit, window)
    }

    /// Create a limiter over an existing counter store.
    pub fn with_store(
        store: Arc<CounterStore>,
        clock: SharedClock,
        permit_limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            permit_limit,
            window,
        }
    }

    /// The counter store backing this limiter.
    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    /// Count one request against `key` and decide synchronously.
    pub fn check(&self, key: &PartitionKey) -> LimiterOutcome {
        let entry = self.store.increment_and_get(key, self.window);
        if entry.count <= self.permit_limit {
            return LimiterOutcome::admitted();
        }

        let retry_after = entry.remaining(self.clock.now());
        debug!(
            key = %key,
            count = entry.count,
            limit = self.permit_limit,
            retry_after_ms = retry_after.as_millis() as u64,
            "Fixed window limit exceeded"
        );
        LimiterOutcome::rejected(
            exceeded_message(self.permit_limit, self.window.as_secs_f64()),
            Some(retry_after),
        )
    }
}

/// The rejection message shared by window-based limiters.
pub(crate) fn exceeded_message(permit_limit: u64, window_secs: f64) -> String {
    format!(
        "Rate limit exceeded. You can only make {} requests in {} seconds.",
        permit_limit,
        format_seconds(window_secs)
    )
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    async fn acquire(&self, key: &PartitionKey) -> Result<LimiterOutcome> {
        Ok(self.check(key))
    }

    fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }
}
