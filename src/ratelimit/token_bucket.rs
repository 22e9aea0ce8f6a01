//! Token bucket limiter with optional queueing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::clock::SharedClock;
use super::limiter::{format_seconds, Algorithm, Limiter};
use super::partition::PartitionKey;
use super::queue::{QueueSettings, TicketId, WaitQueue};
use super::verdict::LimiterOutcome;
use crate::error::Result;

/// Absorbs floating point drift in lazily refilled balances.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    waiters: WaitQueue<()>,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }

    fn has_token(&self) -> bool {
        self.tokens + TOKEN_EPSILON >= 1.0
    }

    fn take(&mut self) {
        self.tokens = (self.tokens - 1.0).max(0.0);
    }
}

#[derive(Debug)]
struct BucketCell {
    state: Mutex<BucketState>,
    /// Signalled whenever a waiter leaves the queue
    turn_changed: Notify,
}

/// Admits while a lazily replenished token balance covers the request.
///
/// Balances are recomputed from elapsed time on each access; no timers run
/// for idle partitions. When a queue is configured, requests that find the
/// bucket empty wait for replenishment in queue order, up to the queue
/// timeout.
pub struct TokenBucketLimiter {
    cells: DashMap<PartitionKey, Arc<BucketCell>>,
    clock: SharedClock,
    capacity: u64,
    tokens_per_period: u64,
    period: Duration,
    queue: QueueSettings,
}

impl TokenBucketLimiter {
    /// Create a limiter holding up to `capacity` tokens and adding
    /// `tokens_per_period` every `period`.
    pub fn new(
        clock: SharedClock,
        capacity: u64,
        tokens_per_period: u64,
        period: Duration,
        queue: QueueSettings,
    ) -> Self {
        Self {
            cells: DashMap::new(),
            clock,
            capacity,
            tokens_per_period,
            period,
            queue,
        }
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.tokens_per_period as f64 / self.period.as_secs_f64()
    }

    fn cell(&self, key: &PartitionKey) -> Arc<BucketCell> {
        let now = self.clock.now();
        let capacity = self.capacity as f64;
        let queue = &self.queue;
        self.cells
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(BucketCell {
                    state: Mutex::new(BucketState {
                        tokens: capacity,
                        last_refill: now,
                        waiters: WaitQueue::new(queue),
                    }),
                    turn_changed: Notify::new(),
                })
            })
            .clone()
    }

    /// Time until `needed` tokens are available given the current balance.
    fn time_until(&self, tokens: f64, needed: f64) -> Duration {
        let deficit = (needed - tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.refill_rate())
    }

    fn exceeded(&self, retry_after: Option<Duration>) -> LimiterOutcome {
        LimiterOutcome::rejected(
            format!(
                "Rate limit exceeded. You can make {} requests in a burst, replenished at {} requests every {} seconds.",
                self.capacity,
                self.tokens_per_period,
                format_seconds(self.period.as_secs_f64())
            ),
            retry_after,
        )
    }

    /// Current token balance of `key`, refilled to now.
    pub fn available(&self, key: &PartitionKey) -> f64 {
        match self.cells.get(key).map(|cell| Arc::clone(&cell)) {
            Some(cell) => {
                let mut state = cell.state.lock();
                state.refill(self.clock.now(), self.capacity as f64, self.refill_rate());
                state.tokens
            }
            None => self.capacity as f64,
        }
    }

    /// Number of requests waiting on `key`.
    pub fn queued(&self, key: &PartitionKey) -> usize {
        self.cells
            .get(key)
            .map(|cell| cell.state.lock().waiters.len())
            .unwrap_or(0)
    }

    /// Wait until ticket `id` is next in line and a token is available.
    async fn wait_turn(&self, cell: &BucketCell, id: TicketId) {
        let capacity = self.capacity as f64;
        let rate = self.refill_rate();
        loop {
            let notified = cell.turn_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = cell.state.lock();
                state.refill(self.clock.now(), capacity, rate);
                if state.waiters.next_ticket() == Some(id) {
                    if state.has_token() {
                        state.take();
                        state.waiters.remove(id);
                        drop(state);
                        cell.turn_changed.notify_waiters();
                        return;
                    }
                    Some(self.time_until(state.tokens, 1.0))
                } else {
                    None
                }
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Removes an abandoned ticket from its queue.
struct QueuedTicket {
    cell: Arc<BucketCell>,
    id: TicketId,
    served: bool,
}

impl Drop for QueuedTicket {
    fn drop(&mut self) {
        if self.served {
            return;
        }
        let removed = self.cell.state.lock().waiters.remove(self.id).is_some();
        if removed {
            self.cell.turn_changed.notify_waiters();
        }
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn acquire(&self, key: &PartitionKey) -> Result<LimiterOutcome> {
        let cell = self.cell(key);
        let id = {
            let mut state = cell.state.lock();
            state.refill(self.clock.now(), self.capacity as f64, self.refill_rate());

            let may_take = state.waiters.is_empty() || self.queue.arrivals_may_overtake();
            if may_take && state.has_token() {
                state.take();
                trace!(key = %key, tokens = state.tokens, "Token taken");
                return Ok(LimiterOutcome::admitted());
            }

            let needed = (state.waiters.len() + 1) as f64;
            let retry_after = self.time_until(state.tokens, needed);
            match state.waiters.try_push(()) {
                Ok(id) => id,
                Err(()) => {
                    debug!(
                        key = %key,
                        tokens = state.tokens,
                        queued = state.waiters.len(),
                        "Token bucket empty"
                    );
                    return Ok(self.exceeded(Some(retry_after)));
                }
            }
        };

        let mut ticket = QueuedTicket {
            cell: Arc::clone(&cell),
            id,
            served: false,
        };
        trace!(key = %key, ticket = id, "Request queued for a token");

        match tokio::time::timeout(self.queue.timeout, self.wait_turn(&cell, id)).await {
            Ok(()) => {
                ticket.served = true;
                Ok(LimiterOutcome::admitted())
            }
            Err(_) => {
                debug!(key = %key, ticket = id, "Queued request timed out");
                Ok(self.exceeded(None))
            }
        }
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let capacity = self.capacity as f64;
        let rate = self.refill_rate();
        let before = self.cells.len();
        self.cells.retain(|_, cell| {
            if Arc::strong_count(cell) > 1 {
                return true;
            }
            let mut state = cell.state.lock();
            state.refill(now, capacity, rate);
            !state.waiters.is_empty() || state.tokens + TOKEN_EPSILON < capacity
        });
        before.saturating_sub(self.cells.len())
    }
}
