//! Limiter policy configuration and construction.
//!
//! A policy describes one limiter: its algorithm, how it partitions
//! requests, and the algorithm's parameters. Policies are validated when
//! the service starts; an invalid policy is reported as a configuration
//! error and the caller leaves that limiter out.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::clock::SharedClock;
use super::concurrency::ConcurrencyLimiter;
use super::fixed_window::FixedWindowLimiter;
use super::limiter::{Algorithm, Limiter};
use super::partition::PartitionBy;
use super::queue::{QueueOrder, QueueSettings};
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::error::{AdmissionError, Result};

/// Upper bound on sliding window segments; each partition allocates one
/// counter per segment.
pub const MAX_SEGMENTS_PER_WINDOW: u32 = 1_000;

/// Parameters of one limiter.
///
/// Fields irrelevant to the chosen algorithm are ignored. Queue settings
/// apply to the token bucket and concurrency algorithms only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub algorithm: Algorithm,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub partition: PartitionBy,
    /// Requests per window, or concurrent requests for `concurrency`
    #[serde(default)]
    pub permit_limit: u64,
    #[serde(default)]
    pub window_seconds: f64,
    #[serde(default = "default_segments")]
    pub segments_per_window: u32,
    /// Bucket capacity
    #[serde(default)]
    pub token_limit: u64,
    #[serde(default)]
    pub tokens_per_period: u64,
    #[serde(default)]
    pub replenishment_period_seconds: f64,
    #[serde(default)]
    pub queue_limit: usize,
    #[serde(default)]
    pub queue_order: QueueOrder,
    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_seconds: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_segments() -> u32 {
    1
}

fn default_queue_timeout() -> f64 {
    30.0
}

impl LimiterConfig {
    fn base(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            enabled: default_enabled(),
            partition: PartitionBy::default(),
            permit_limit: 0,
            window_seconds: 0.0,
            segments_per_window: default_segments(),
            token_limit: 0,
            tokens_per_period: 0,
            replenishment_period_seconds: 0.0,
            queue_limit: 0,
            queue_order: QueueOrder::default(),
            queue_timeout_seconds: default_queue_timeout(),
        }
    }

    pub fn fixed_window(permit_limit: u64, window_seconds: f64) -> Self {
        Self {
            permit_limit,
            window_seconds,
            ..Self::base(Algorithm::FixedWindow)
        }
    }

    pub fn sliding_window(permit_limit: u64, window_seconds: f64, segments: u32) -> Self {
        Self {
            permit_limit,
            window_seconds,
            segments_per_window: segments,
            ..Self::base(Algorithm::SlidingWindow)
        }
    }

    pub fn token_bucket(token_limit: u64, tokens_per_period: u64, period_seconds: f64) -> Self {
        Self {
            token_limit,
            tokens_per_period,
            replenishment_period_seconds: period_seconds,
            ..Self::base(Algorithm::TokenBucket)
        }
    }

    pub fn concurrency(permit_limit: u64) -> Self {
        Self {
            permit_limit,
            ..Self::base(Algorithm::Concurrency)
        }
    }

    pub fn partitioned_by(mut self, partition: PartitionBy) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_queue(mut self, limit: usize, order: QueueOrder, timeout_seconds: f64) -> Self {
        self.queue_limit = limit;
        self.queue_order = order;
        self.queue_timeout_seconds = timeout_seconds;
        self
    }

    /// Check the parameters the chosen algorithm needs.
    pub fn validate(&self) -> Result<()> {
        match self.algorithm {
            Algorithm::FixedWindow => {
                require_positive("permit_limit", self.permit_limit)?;
                positive_seconds("window_seconds", self.window_seconds)?;
            }
            Algorithm::SlidingWindow => {
                require_positive("permit_limit", self.permit_limit)?;
                positive_seconds("window_seconds", self.window_seconds)?;
                require_positive("segments_per_window", u64::from(self.segments_per_window))?;
                let window_nanos = Duration::from_secs_f64(self.window_seconds).as_nanos();
                if self.segments_per_window > MAX_SEGMENTS_PER_WINDOW
                    || u128::from(self.segments_per_window) > window_nanos
                {
                    return Err(AdmissionError::Config(format!(
                        "segments_per_window must be at most {} and no more than the window in nanoseconds, got {}",
                        MAX_SEGMENTS_PER_WINDOW, self.segments_per_window
                    )));
                }
            }
            Algorithm::TokenBucket => {
                require_positive("token_limit", self.token_limit)?;
                require_positive("tokens_per_period", self.tokens_per_period)?;
                positive_seconds(
                    "replenishment_period_seconds",
                    self.replenishment_period_seconds,
                )?;
            }
            Algorithm::Concurrency => {
                require_positive("permit_limit", self.permit_limit)?;
            }
        }
        if self.queue_limit > 0 {
            positive_seconds("queue_timeout_seconds", self.queue_timeout_seconds)?;
        }
        Ok(())
    }

    /// Queue behavior for limiters that support waiting.
    pub fn queue_settings(&self) -> QueueSettings {
        if self.queue_limit == 0 {
            return QueueSettings::disabled();
        }
        QueueSettings {
            limit: self.queue_limit,
            order: self.queue_order,
            timeout: Duration::from_secs_f64(self.queue_timeout_seconds),
        }
    }

    /// Validate the policy and construct its limiter.
    pub fn build(&self, clock: &SharedClock) -> Result<Arc<dyn Limiter>> {
        self.validate()?;
        let limiter: Arc<dyn Limiter> = match self.algorithm {
            Algorithm::FixedWindow => Arc::new(FixedWindowLimiter::new(
                clock.clone(),
                self.permit_limit,
                Duration::from_secs_f64(self.window_seconds),
            )),
            Algorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::new(
                clock.clone(),
                self.permit_limit,
                Duration::from_secs_f64(self.window_seconds),
                self.segments_per_window,
            )),
            Algorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(
                clock.clone(),
                self.token_limit,
                self.tokens_per_period,
                Duration::from_secs_f64(self.replenishment_period_seconds),
                self.queue_settings(),
            )),
            Algorithm::Concurrency => Arc::new(ConcurrencyLimiter::new(
                self.permit_limit,
                self.queue_settings(),
            )),
        };
        Ok(limiter)
    }
}

fn require_positive(field: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(AdmissionError::Config(format!("{} must be positive", field)));
    }
    Ok(())
}

fn positive_seconds(field: &str, secs: f64) -> Result<()> {
    // Upper bound keeps Duration::from_secs_f64 from panicking.
    if !secs.is_finite() || secs <= 0.0 || secs > u32::MAX as f64 {
        return Err(AdmissionError::Config(format!(
            "{} must be a positive number of seconds, got {}",
            field, secs
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn clock() -> SharedClock {
        Arc::new(ManualClock::default())
    }

    #[test]
    fn test_parse_limiter_config() {
        let yaml = r#"
algorithm: sliding_window
partition: client_address
permit_limit: 100
window_seconds: 60
segments_per_window: 10
queue_limit: 5
queue_order: newest_first
"#;
        let config: LimiterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.algorithm, Algorithm::SlidingWindow);
        assert_eq!(config.partition, PartitionBy::ClientAddress);
        assert_eq!(config.window_seconds, 60.0);
        assert!(config.enabled);
        assert_eq!(config.queue_settings().order, QueueOrder::NewestFirst);
        assert_eq!(config.queue_settings().timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_build_each_algorithm() {
        let clock = clock();
        let configs = [
            LimiterConfig::fixed_window(5, 60.0),
            LimiterConfig::sliding_window(100, 60.0, 10),
            LimiterConfig::token_bucket(100, 10, 60.0),
            LimiterConfig::concurrency(10),
        ];
        for config in configs {
            let limiter = config.build(&clock).unwrap();
            assert_eq!(limiter.algorithm(), config.algorithm);
        }
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let clock = clock();
        let invalid = [
            LimiterConfig::fixed_window(0, 60.0),
            LimiterConfig::fixed_window(5, 0.0),
            LimiterConfig::fixed_window(5, f64::NAN),
            LimiterConfig::sliding_window(5, 60.0, 0),
            LimiterConfig::sliding_window(5, 60.0, 4_000_000_000),
            LimiterConfig::sliding_window(5, 60.0, MAX_SEGMENTS_PER_WINDOW + 1),
            LimiterConfig::sliding_window(5, 0.000_000_01, 20),
            LimiterConfig::token_bucket(10, 0, 60.0),
            LimiterConfig::token_bucket(10, 1, -1.0),
            LimiterConfig::concurrency(0),
            LimiterConfig::concurrency(2).with_queue(3, QueueOrder::OldestFirst, 0.0),
        ];
        for config in invalid {
            let err = config.build(&clock).err().expect("config should be invalid");
            assert!(err.is_config_error(), "{:?}", config);
        }
    }

    #[test]
    fn test_segment_bound_is_inclusive() {
        let config = LimiterConfig::sliding_window(5, 60.0, MAX_SEGMENTS_PER_WINDOW);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_disabled_without_limit() {
        let config = LimiterConfig::token_bucket(1, 1, 1.0);
        assert_eq!(config.queue_settings(), QueueSettings::disabled());
    }
}
