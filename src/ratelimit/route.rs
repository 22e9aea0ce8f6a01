//! Route-scoped limiter for individually opted-in endpoints.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::clock::SharedClock;
use super::counter::CounterStore;
use super::fixed_window::exceeded_message;
use super::partition::{PartitionKey, RequestDescriptor};
use super::verdict::{Rejection, Verdict};
use crate::config::RateLimitSettings;

/// Name reported for rejections issued by the route-scoped limiter.
pub const ROUTE_LIMITER_NAME: &str = "route";

/// Fixed window limiter keyed by `route-name:client-identity`.
///
/// Every opted-in route shares one counter store; the key keeps their
/// counters apart. Settings are read on each evaluation and a disabled or
/// invalid configuration admits without touching any counter.
pub struct RouteRateLimiter {
    store: Arc<CounterStore>,
    clock: SharedClock,
    settings: RateLimitSettings,
}

impl RouteRateLimiter {
    pub fn new(clock: SharedClock, settings: RateLimitSettings) -> Self {
        if settings.enable_rate_limiting {
            if let Err(err) = settings.validate() {
                warn!(error = %err, "Route rate limiting disabled by invalid settings");
            }
        }
        Self {
            store: Arc::new(CounterStore::new(clock.clone())),
            clock,
            settings,
        }
    }

    /// The counter store shared by every route.
    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enable_rate_limiting && self.settings.validate().is_ok()
    }

    /// Count `request` against its route and client and decide.
    pub fn check(&self, request: &RequestDescriptor) -> Verdict {
        if !self.is_enabled() {
            return Verdict::admit();
        }

        let key = PartitionKey::route_scoped(request);
        let window = Duration::from_secs_f64(self.settings.time_window_seconds);
        let entry = self.store.increment_and_get(&key, window);
        if entry.count <= self.settings.max_requests {
            return Verdict::admit();
        }

        let retry_after = entry.remaining(self.clock.now());
        debug!(
            key = %key,
            count = entry.count,
            limit = self.settings.max_requests,
            "Route rate limit exceeded"
        );
        Verdict::reject(
            ROUTE_LIMITER_NAME,
            Rejection::new(
                exceeded_message(self.settings.max_requests, self.settings.time_window_seconds),
                Some(retry_after),
            ),
        )
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn settings(enabled: bool, max_requests: u64, window: f64) -> RateLimitSettings {
        RateLimitSettings {
            enable_rate_limiting: enabled,
            max_requests,
            time_window_seconds: window,
        }
    }

    fn limiter(settings: RateLimitSettings) -> (RouteRateLimiter, ManualClock) {
        let clock = ManualClock::default();
        (RouteRateLimiter::new(Arc::new(clock.clone()), settings), clock)
    }

    #[test]
    fn test_limits_per_route_and_client() {
        let (limiter, clock) = limiter(settings(true, 2, 10.0));
        let home = RequestDescriptor::new("/api/home").with_remote_addr("10.0.0.1");

        assert!(limiter.check(&home).admitted);
        assert!(limiter.check(&home).admitted);

        clock.advance(Duration::from_secs(4));
        let verdict = limiter.check(&home);
        assert!(!verdict.admitted);
        assert_eq!(verdict.retry_after, Some(Duration::from_secs(6)));
        assert_eq!(verdict.limiter.as_deref(), Some(ROUTE_LIMITER_NAME));
        assert_eq!(
            verdict.reason,
            "Rate limit exceeded. You can only make 2 requests in 10 seconds."
        );

        let other_client = RequestDescriptor::new("/api/home").with_remote_addr("10.0.0.2");
        assert!(limiter.check(&other_client).admitted);
        let other_route = RequestDescriptor::new("/api/v1/status").with_remote_addr("10.0.0.1");
        assert!(limiter.check(&other_route).admitted);

        assert_eq!(
            limiter
                .store()
                .peek(&PartitionKey::from("home:10.0.0.1"))
                .map(|e| e.count),
            Some(3)
        );
    }

    #[test]
    fn test_window_expiry_starts_fresh() {
        let (limiter, clock) = limiter(settings(true, 1, 1.5));
        let request = RequestDescriptor::new("/api/home").with_forwarded_for("203.0.113.5");

        assert!(limiter.check(&request).admitted);
        assert!(!limiter.check(&request).admitted);
        clock.advance(Duration::from_millis(1_500));
        assert!(limiter.check(&request).admitted);
    }

    #[test]
    fn test_disabled_admits_without_counting() {
        let (limiter, _clock) = limiter(settings(false, 1, 10.0));
        let request = RequestDescriptor::new("/api/home").with_remote_addr("10.0.0.1");

        for _ in 0..10 {
            assert!(limiter.check(&request).admitted);
        }
        assert!(limiter.store().is_empty());
    }

    #[test]
    fn test_invalid_settings_disable_limiting() {
        let (limiter, _clock) = limiter(settings(true, 0, 10.0));
        assert!(!limiter.is_enabled());
        let request = RequestDescriptor::new("/api/home");
        assert!(limiter.check(&request).admitted);
        assert!(limiter.store().is_empty());
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_limit() {
        let (limiter, _clock) = limiter(settings(true, 25, 60.0));
        let limiter = Arc::new(limiter);
        let request = RequestDescriptor::new("/api/home").with_remote_addr("10.9.9.9");

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    let request = request.clone();
                    scope.spawn(move || (0..25).filter(|_| limiter.check(&request).admitted).count())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(admitted, 25);
    }
}
