//! Bounded wait queues for limiters that hold requests instead of rejecting.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Order in which queued requests are served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// Earliest-queued request is served first; new arrivals never overtake it
    #[default]
    OldestFirst,
    /// Most recently queued request is served first
    NewestFirst,
}

/// Queueing parameters of a limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSettings {
    /// Maximum number of waiting requests; zero disables queueing
    pub limit: usize,
    pub order: QueueOrder,
    /// Longest a request may wait before it is rejected
    pub timeout: Duration,
}

impl QueueSettings {
    /// Settings that reject immediately instead of queueing.
    pub fn disabled() -> Self {
        Self {
            limit: 0,
            order: QueueOrder::OldestFirst,
            timeout: Duration::ZERO,
        }
    }

    /// Whether an arrival may take free capacity while others are waiting.
    pub fn arrivals_may_overtake(&self) -> bool {
        self.order == QueueOrder::NewestFirst
    }
}

/// Ticket identifying one queued request.
pub type TicketId = u64;

/// A bounded queue of waiters served in [`QueueOrder`].
#[derive(Debug)]
pub struct WaitQueue<T> {
    order: QueueOrder,
    limit: usize,
    next_id: TicketId,
    entries: VecDeque<(TicketId, T)>,
}

impl<T> WaitQueue<T> {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            order: settings.order,
            limit: settings.limit,
            next_id: 0,
            entries: VecDeque::new(),
        }
    }

    /// Enqueue `waiter`, or hand it back when the queue is full.
    pub fn try_push(&mut self, waiter: T) -> std::result::Result<TicketId, T> {
        if self.entries.len() >= self.limit {
            return Err(waiter);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back((id, waiter));
        Ok(id)
    }

    /// The ticket that will be served next.
    pub fn next_ticket(&self) -> Option<TicketId> {
        let next = match self.order {
            QueueOrder::OldestFirst => self.entries.front(),
            QueueOrder::NewestFirst => self.entries.back(),
        };
        next.map(|(id, _)| *id)
    }

    /// Remove and return the waiter that is served next.
    pub fn pop_next(&mut self) -> Option<(TicketId, T)> {
        match self.order {
            QueueOrder::OldestFirst => self.entries.pop_front(),
            QueueOrder::NewestFirst => self.entries.pop_back(),
        }
    }

    /// Remove a specific ticket, e.g. when its caller gave up.
    pub fn remove(&mut self, id: TicketId) -> Option<T> {
        let position = self.entries.iter().position(|(ticket, _)| *ticket == id)?;
        self.entries.remove(position).map(|(_, waiter)| waiter)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(limit: usize, order: QueueOrder) -> QueueSettings {
        QueueSettings {
            limit,
            order,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_oldest_first_serves_in_arrival_order() {
        let mut queue = WaitQueue::new(&settings(3, QueueOrder::OldestFirst));
        queue.try_push("a").unwrap();
        queue.try_push("b").unwrap();

        assert_eq!(queue.pop_next().map(|(_, w)| w), Some("a"));
        assert_eq!(queue.pop_next().map(|(_, w)| w), Some("b"));
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn test_newest_first_serves_latest_arrival() {
        let mut queue = WaitQueue::new(&settings(3, QueueOrder::NewestFirst));
        queue.try_push("a").unwrap();
        let b = queue.try_push("b").unwrap();

        assert_eq!(queue.next_ticket(), Some(b));
        assert_eq!(queue.pop_next().map(|(_, w)| w), Some("b"));
        assert_eq!(queue.pop_next().map(|(_, w)| w), Some("a"));
    }

    #[test]
    fn test_full_queue_returns_waiter() {
        let mut queue = WaitQueue::new(&settings(1, QueueOrder::OldestFirst));
        queue.try_push(1).unwrap();
        assert_eq!(queue.try_push(2), Err(2));

        let mut disabled = WaitQueue::new(&QueueSettings::disabled());
        assert_eq!(disabled.try_push(1), Err(1));
    }

    #[test]
    fn test_remove_frees_capacity() {
        let mut queue = WaitQueue::new(&settings(2, QueueOrder::OldestFirst));
        let a = queue.try_push('a').unwrap();
        queue.try_push('b').unwrap();

        assert_eq!(queue.remove(a), Some('a'));
        assert_eq!(queue.remove(a), None);
        assert_eq!(queue.len(), 1);
        assert!(queue.try_push('c').is_ok());
    }
}
