//! Sliding window limiter.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::clock::SharedClock;
use super::fixed_window::exceeded_message;
use super::limiter::{Algorithm, Limiter};
use super::partition::PartitionKey;
use super::policy::MAX_SEGMENTS_PER_WINDOW;
use super::verdict::LimiterOutcome;
use crate::error::Result;

/// Per-partition ring of segment counters.
///
/// Holds one slot more than the number of segments so the partially expired
/// segment at the tail of the window is still available for weighting.
#[derive(Debug)]
struct SegmentRing {
    epoch: Instant,
    /// Absolute index of the newest segment
    head: u64,
    counts: Vec<u64>,
    last_admit: Instant,
}

impl SegmentRing {
    fn new(now: Instant, segments: u32) -> Self {
        Self {
            epoch: now,
            head: 0,
            counts: vec![0; segments as usize + 1],
            last_admit: now,
        }
    }

    fn slot(&self, index: u64) -> usize {
        (index % self.counts.len() as u64) as usize
    }

    /// Roll the ring forward, clearing segments that left the window.
    fn advance_to(&mut self, current: u64) {
        if current <= self.head {
            return;
        }
        let stale = (current - self.head).min(self.counts.len() as u64);
        for step in 0..stale {
            let slot = self.slot(current - step);
            self.counts[slot] = 0;
        }
        self.head = current;
    }
}

/// Approximates a continuously moving window with weighted sub-windows.
///
/// The effective count is the sum of the segments inside the window plus
/// the oldest, partially expired segment scaled by how much of it still
/// overlaps `[now - window, now]`.
pub struct SlidingWindowLimiter {
    rings: DashMap<PartitionKey, SegmentRing>,
    clock: SharedClock,
    permit_limit: u64,
    window: Duration,
    segments: u32,
}

impl SlidingWindowLimiter {
    /// Create a limiter. `segments` is clamped to
    /// `1..=MAX_SEGMENTS_PER_WINDOW`.
    pub fn new(clock: SharedClock, permit_limit: u64, window: Duration, segments: u32) -> Self {
        Self {
            rings: DashMap::new(),
            clock,
            permit_limit,
            window,
            segments: segments.clamp(1, MAX_SEGMENTS_PER_WINDOW),
        }
    }

    fn segment_len(&self) -> Duration {
        self.window / self.segments
    }

    /// Count one request against `key` and decide synchronously.
    pub fn check(&self, key: &PartitionKey) -> LimiterOutcome {
        let now = self.clock.now();
        let segment_len = self.segment_len();
        let segment_nanos = segment_len.as_nanos().max(1);

        let mut ring = self
            .rings
            .entry(key.clone())
            .or_insert_with(|| SegmentRing::new(now, self.segments));
        if now.saturating_duration_since(ring.last_admit) >= self.window + segment_len {
            *ring = SegmentRing::new(now, self.segments);
        }

        let elapsed = now.saturating_duration_since(ring.epoch).as_nanos();
        let current = (elapsed / segment_nanos) as u64;
        let into_segment = (elapsed % segment_nanos) as f64 / segment_nanos as f64;
        ring.advance_to(current);

        let oldest_live = current.saturating_sub(u64::from(self.segments) - 1);
        let live: u64 = (oldest_live..=current)
            .map(|index| ring.counts[ring.slot(index)])
            .sum();
        let tail = if current >= u64::from(self.segments) {
            let expiring = ring.counts[ring.slot(current - u64::from(self.segments))];
            expiring as f64 * (1.0 - into_segment)
        } else {
            0.0
        };
        let effective = live as f64 + tail;

        if effective + 1.0 <= self.permit_limit as f64 {
            let slot = ring.slot(current);
            ring.counts[slot] += 1;
            ring.last_admit = now;
            return LimiterOutcome::admitted();
        }

        let retry_after = segment_len.mul_f64(1.0 - into_segment);
        debug!(
            key = %key,
            effective = effective,
            limit = self.permit_limit,
            "Sliding window limit exceeded"
        );
        LimiterOutcome::rejected(
            exceeded_message(self.permit_limit, self.window.as_secs_f64()),
            Some(retry_after),
        )
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    async fn acquire(&self, key: &PartitionKey) -> Result<LimiterOutcome> {
        Ok(self.check(key))
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let horizon = self.window + self.segment_len();
        let before = self.rings.len();
        self.rings
            .retain(|_, ring| now.saturating_duration_since(ring.last_admit) < horizon);
        before.saturating_sub(self.rings.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::fixed_window::FixedWindowLimiter;
    use std::sync::Arc;

    fn limiter(limit: u64, window_secs: u64, segments: u32) -> (SlidingWindowLimiter, ManualClock) {
        let clock = ManualClock::default();
        (
            SlidingWindowLimiter::new(
                Arc::new(clock.clone()),
                limit,
                Duration::from_secs(window_secs),
                segments,
            ),
            clock,
        )
    }

    fn admitted(limiter: &SlidingWindowLimiter, key: &PartitionKey, attempts: usize) -> usize {
        (0..attempts)
            .filter(|_| limiter.check(key).is_admitted())
            .count()
    }

    #[test]
    fn test_admits_up_to_limit() {
        let (limiter, _clock) = limiter(3, 10, 5);
        let key = PartitionKey::from("k");
        assert_eq!(admitted(&limiter, &key, 5), 3);
    }

    #[test]
    fn test_second_burst_late_in_window_is_rejected() {
        let (limiter, clock) = limiter(100, 60, 10);
        let key = PartitionKey::from("client");

        assert_eq!(admitted(&limiter, &key, 100), 100);
        clock.advance(Duration::from_secs(59));
        assert!(admitted(&limiter, &key, 100) < 100);
    }

    #[test]
    fn test_smooths_burst_across_window_boundary() {
        let (sliding, clock) = limiter(100, 60, 10);
        let fixed = FixedWindowLimiter::new(Arc::new(clock.clone()), 100, Duration::from_secs(60));
        let key = PartitionKey::from("client");

        assert_eq!(admitted(&sliding, &key, 100), 100);
        assert!((0..100).all(|_| fixed.check(&key).is_admitted()));

        // One second into the 11th segment, 5/6 of the first burst still counts.
        clock.advance(Duration::from_secs(61));
        assert_eq!(admitted(&sliding, &key, 100), 16);
        assert!((0..100).all(|_| fixed.check(&key).is_admitted()));
    }

    #[test]
    fn test_counts_fully_expire() {
        let (limiter, clock) = limiter(10, 10, 2);
        let key = PartitionKey::from("k");
        assert_eq!(admitted(&limiter, &key, 10), 10);
        assert!(!limiter.check(&key).is_admitted());

        clock.advance(Duration::from_secs(15));
        assert_eq!(admitted(&limiter, &key, 10), 10);
    }

    #[test]
    fn test_retry_after_points_at_next_segment() {
        let (limiter, clock) = limiter(1, 10, 5);
        let key = PartitionKey::from("k");
        assert!(limiter.check(&key).is_admitted());

        clock.advance(Duration::from_millis(500));
        match limiter.check(&key) {
            LimiterOutcome::Rejected(rejection) => {
                assert_eq!(rejection.retry_after, Some(Duration::from_millis(1_500)));
            }
            LimiterOutcome::Admitted(_) => panic!("second request should be rejected"),
        }
    }

    #[test]
    fn test_segment_count_is_clamped() {
        let (limiter, _clock) = limiter(5, 60, u32::MAX);
        limiter.check(&PartitionKey::from("k"));
        let ring = limiter.rings.get(&PartitionKey::from("k")).unwrap();
        assert_eq!(ring.counts.len(), MAX_SEGMENTS_PER_WINDOW as usize + 1);
    }

    #[test]
    fn test_purge_drops_idle_partitions() {
        let (limiter, clock) = limiter(5, 10, 5);
        limiter.check(&PartitionKey::from("idle"));
        clock.advance(Duration::from_secs(11));
        limiter.check(&PartitionKey::from("busy"));

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.purge_expired(), 1);
    }
}
