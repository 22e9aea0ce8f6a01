//! Concurrency slot limiter.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::limiter::{Algorithm, Limiter};
use super::partition::PartitionKey;
use super::queue::{QueueSettings, TicketId, WaitQueue};
use super::verdict::{Lease, LimiterOutcome};
use crate::error::{AdmissionError, Result};

#[derive(Debug)]
struct SlotState {
    in_flight: u64,
    /// Each waiter is handed its slot directly through its sender
    waiters: WaitQueue<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct SlotCell {
    state: Mutex<SlotState>,
}

impl SlotCell {
    /// Give a finished request's slot to the next waiter, or free it.
    fn release(&self) {
        let mut state = self.state.lock();
        while let Some((_, waiter)) = state.waiters.pop_next() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// An occupied concurrency slot, released when dropped.
pub struct SlotGuard {
    cell: Arc<SlotCell>,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard").finish_non_exhaustive()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.cell.release();
    }
}

/// A queued request that has not yet received its slot.
struct SlotTicket {
    cell: Arc<SlotCell>,
    id: TicketId,
    receiver: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for SlotTicket {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        if self.cell.state.lock().waiters.remove(self.id).is_some() {
            return;
        }
        // The slot was handed over after we stopped waiting: pass it on.
        if self.receiver.try_recv().is_ok() {
            self.cell.release();
        }
    }
}

/// Bounds the number of in-flight requests per partition.
///
/// Admitted requests carry a [`Lease`] holding their slot; dropping the
/// lease releases the slot on every exit path, including cancellation.
/// Requests beyond the limit wait in a bounded queue or are rejected.
pub struct ConcurrencyLimiter {
    cells: DashMap<PartitionKey, Arc<SlotCell>>,
    permit_limit: u64,
    queue: QueueSettings,
}

impl ConcurrencyLimiter {
    pub fn new(permit_limit: u64, queue: QueueSettings) -> Self {
        Self {
            cells: DashMap::new(),
            permit_limit,
            queue,
        }
    }

    fn cell(&self, key: &PartitionKey) -> Arc<SlotCell> {
        let queue = &self.queue;
        self.cells
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(SlotCell {
                    state: Mutex::new(SlotState {
                        in_flight: 0,
                        waiters: WaitQueue::new(queue),
                    }),
                })
            })
            .clone()
    }

    /// Free slots for `key`.
    pub fn available(&self, key: &PartitionKey) -> u64 {
        let in_flight = self
            .cells
            .get(key)
            .map(|cell| cell.state.lock().in_flight)
            .unwrap_or(0);
        self.permit_limit.saturating_sub(in_flight)
    }

    /// Number of requests waiting on `key`.
    pub fn queued(&self, key: &PartitionKey) -> usize {
        self.cells
            .get(key)
            .map(|cell| cell.state.lock().waiters.len())
            .unwrap_or(0)
    }

    fn exceeded(&self) -> LimiterOutcome {
        LimiterOutcome::rejected(
            format!(
                "Rate limit exceeded. You can only make {} concurrent requests.",
                self.permit_limit
            ),
            None,
        )
    }
}

#[async_trait]
impl Limiter for ConcurrencyLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Concurrency
    }

    async fn acquire(&self, key: &PartitionKey) -> Result<LimiterOutcome> {
        let cell = self.cell(key);
        let (id, receiver) = {
            let mut state = cell.state.lock();
            let may_take = state.waiters.is_empty() || self.queue.arrivals_may_overtake();
            if may_take && state.in_flight < self.permit_limit {
                state.in_flight += 1;
                trace!(key = %key, in_flight = state.in_flight, "Slot acquired");
                drop(state);
                return Ok(LimiterOutcome::Admitted(Lease::slot(SlotGuard { cell })));
            }

            let (sender, receiver) = oneshot::channel();
            match state.waiters.try_push(sender) {
                Ok(id) => (id, receiver),
                Err(_) => {
                    debug!(
                        key = %key,
                        in_flight = state.in_flight,
                        "Concurrency limit exceeded"
                    );
                    return Ok(self.exceeded());
                }
            }
        };

        let mut ticket = SlotTicket {
            cell: Arc::clone(&cell),
            id,
            receiver,
            granted: false,
        };
        trace!(key = %key, ticket = id, "Request queued for a slot");

        match tokio::time::timeout(self.queue.timeout, &mut ticket.receiver).await {
            Ok(Ok(())) => {
                ticket.granted = true;
                Ok(LimiterOutcome::Admitted(Lease::slot(SlotGuard { cell })))
            }
            Ok(Err(_)) => Err(AdmissionError::Unavailable(format!(
                "slot queue for {} was closed",
                key
            ))),
            Err(_) => {
                debug!(key = %key, ticket = id, "Queued request timed out");
                Ok(self.exceeded())
            }
        }
    }

    fn purge_expired(&self) -> usize {
        let before = self.cells.len();
        self.cells.retain(|_, cell| {
            if Arc::strong_count(cell) > 1 {
                return true;
            }
            let state = cell.state.lock();
            state.in_flight > 0 || !state.waiters.is_empty()
        });
        before.saturating_sub(self.cells.len())
    }
}
