//! The limiter abstraction shared by every admission algorithm.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::partition::PartitionKey;
use super::verdict::LimiterOutcome;
use crate::error::Result;

/// Admission algorithm implemented by a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    Concurrency,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::Concurrency => "concurrency",
        };
        f.write_str(name)
    }
}

/// A partitioned admission algorithm.
///
/// Implementations keep independent state per [`PartitionKey`] and must be
/// safe to call from many tasks at once. Only limiters configured with a
/// wait queue may suspend the caller.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// The algorithm this limiter implements.
    fn algorithm(&self) -> Algorithm;

    /// Ask to admit one request in partition `key`.
    ///
    /// Returns `Err` only when the limiter cannot evaluate the request at
    /// all; an exceeded limit is a [`LimiterOutcome::Rejected`].
    async fn acquire(&self, key: &PartitionKey) -> Result<LimiterOutcome>;

    /// Reclaim state for idle partitions, returning how many were dropped.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Format a window length for user-facing messages.
pub(crate) fn format_seconds(secs: f64) -> String {
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{}", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names() {
        assert_eq!(Algorithm::FixedWindow.to_string(), "fixed_window");
        assert_eq!(Algorithm::Concurrency.to_string(), "concurrency");
        let parsed: Algorithm = serde_yaml::from_str("token_bucket").unwrap();
        assert_eq!(parsed, Algorithm::TokenBucket);
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(60.0), "60");
        assert_eq!(format_seconds(1.5), "1.5");
    }
}
