//! Ordered composition of partitioned limiters.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::limiter::Limiter;
use super::partition::{PartitionBy, RequestDescriptor};
use super::verdict::{Lease, LimiterOutcome, Verdict};
use crate::error::Result;

/// What to do when a limiter cannot evaluate a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log a warning and treat the failing limiter as admitting
    #[default]
    FailOpen,
    /// Surface the failure so the request is refused
    FailClosed,
}

/// One named limiter in a chain together with its partition function.
#[derive(Clone)]
pub struct ChainStage {
    pub name: String,
    pub partition: PartitionBy,
    pub limiter: Arc<dyn Limiter>,
}

impl std::fmt::Debug for ChainStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStage")
            .field("name", &self.name)
            .field("partition", &self.partition)
            .field("algorithm", &self.limiter.algorithm())
            .finish()
    }
}

/// Outcome of running a request through a chain.
#[derive(Debug)]
pub struct ChainDecision {
    pub verdict: Verdict,
    /// Leases held by the admitted request; empty on rejection
    pub leases: Vec<Lease>,
}

/// Limiters evaluated in order with AND semantics.
///
/// Evaluation stops at the first rejection, leaving later limiters
/// untouched, so broad and cheap limiters belong at the front. Each stage
/// may partition the same request differently. Leases taken by earlier
/// stages are released when a later stage rejects.
#[derive(Debug, Clone, Default)]
pub struct LimiterChain {
    stages: Vec<ChainStage>,
    failure_policy: FailurePolicy,
}

impl LimiterChain {
    pub fn builder() -> LimiterChainBuilder {
        LimiterChainBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Names of the stages in evaluation order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Run `request` through every stage until one rejects it.
    ///
    /// Returns `Err` only under [`FailurePolicy::FailClosed`] when a stage
    /// cannot evaluate the request.
    pub async fn evaluate(&self, request: &RequestDescriptor) -> Result<ChainDecision> {
        let mut leases = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let key = stage.partition.resolve(request);
            trace!(stage = %stage.name, key = %key, "Evaluating limiter");

            match stage.limiter.acquire(&key).await {
                Ok(LimiterOutcome::Admitted(lease)) => leases.push(lease),
                Ok(LimiterOutcome::Rejected(rejection)) => {
                    debug!(
                        stage = %stage.name,
                        key = %key,
                        reason = %rejection.reason,
                        "Request rejected"
                    );
                    return Ok(ChainDecision {
                        verdict: Verdict::reject(&stage.name, rejection),
                        leases: Vec::new(),
                    });
                }
                Err(err) => match self.failure_policy {
                    FailurePolicy::FailOpen => {
                        warn!(
                            stage = %stage.name,
                            error = %err,
                            "Limiter unavailable, admitting request"
                        );
                    }
                    FailurePolicy::FailClosed => return Err(err),
                },
            }
        }

        Ok(ChainDecision {
            verdict: Verdict::admit(),
            leases,
        })
    }

    /// Reclaim idle partition state in every stage.
    pub fn purge_expired(&self) -> usize {
        self.stages.iter().map(|s| s.limiter.purge_expired()).sum()
    }
}

/// Builder for a [`LimiterChain`].
#[derive(Default)]
pub struct LimiterChainBuilder {
    stages: Vec<ChainStage>,
    failure_policy: FailurePolicy,
}

impl LimiterChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Stages are evaluated in the order they are added.
    pub fn stage(
        mut self,
        name: impl Into<String>,
        partition: PartitionBy,
        limiter: Arc<dyn Limiter>,
    ) -> Self {
        self.stages.push(ChainStage {
            name: name.into(),
            partition,
            limiter,
        });
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn build(self) -> LimiterChain {
        LimiterChain {
            stages: self.stages,
            failure_policy: self.failure_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdmissionError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::concurrency::ConcurrencyLimiter;
    use crate::ratelimit::fixed_window::FixedWindowLimiter;
    use crate::ratelimit::limiter::Algorithm;
    use crate::ratelimit::partition::PartitionKey;
    use crate::ratelimit::queue::QueueSettings;
    use async_trait::async_trait;
    use std::time::Duration;

    /// A limiter whose backing state is unreachable.
    struct UnavailableLimiter;

    #[async_trait]
    impl Limiter for UnavailableLimiter {
        fn algorithm(&self) -> Algorithm {
            Algorithm::FixedWindow
        }

        async fn acquire(&self, _key: &PartitionKey) -> Result<LimiterOutcome> {
            Err(AdmissionError::Unavailable("counter store offline".to_string()))
        }
    }

    fn fixed(clock: &ManualClock, limit: u64, window_secs: u64) -> Arc<FixedWindowLimiter> {
        Arc::new(FixedWindowLimiter::new(
            Arc::new(clock.clone()),
            limit,
            Duration::from_secs(window_secs),
        ))
    }

    fn request(user_agent: &str, addr: &str) -> RequestDescriptor {
        RequestDescriptor::new("/api/home")
            .with_user_agent(user_agent)
            .with_remote_addr(addr)
    }

    #[tokio::test]
    async fn test_empty_chain_admits() {
        let chain = LimiterChain::builder().build();
        let decision = chain.evaluate(&request("ua", "10.0.0.1")).await.unwrap();
        assert!(decision.verdict.admitted);
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_short_circuits_later_stages() {
        let clock = ManualClock::default();
        let per_agent = fixed(&clock, 4, 2);
        let per_ip = fixed(&clock, 20, 30);
        let chain = LimiterChain::builder()
            .stage("per_user_agent", PartitionBy::UserAgent, per_agent.clone())
            .stage("per_ip", PartitionBy::ClientAddress, per_ip.clone())
            .build();
        let req = request("curl/8.0", "10.0.0.1");
        let ip_key = PartitionKey::from("10.0.0.1");

        for _ in 0..4 {
            assert!(chain.evaluate(&req).await.unwrap().verdict.admitted);
        }
        assert_eq!(per_ip.store().peek(&ip_key).map(|e| e.count), Some(4));

        let decision = chain.evaluate(&req).await.unwrap();
        assert!(!decision.verdict.admitted);
        assert_eq!(decision.verdict.limiter.as_deref(), Some("per_user_agent"));
        assert!(decision.verdict.retry_after.is_some());
        assert_eq!(per_ip.store().peek(&ip_key).map(|e| e.count), Some(4));
    }

    #[tokio::test]
    async fn test_stages_partition_independently() {
        let clock = ManualClock::default();
        let chain = LimiterChain::builder()
            .stage("per_user_agent", PartitionBy::UserAgent, fixed(&clock, 1, 60))
            .stage("per_ip", PartitionBy::ClientAddress, fixed(&clock, 1, 60))
            .build();

        assert!(chain.evaluate(&request("a", "10.0.0.1")).await.unwrap().verdict.admitted);

        // Same address, different agent: the per-IP stage rejects.
        let decision = chain.evaluate(&request("b", "10.0.0.1")).await.unwrap();
        assert_eq!(decision.verdict.limiter.as_deref(), Some("per_ip"));

        // Same agent, different address: the per-agent stage rejects.
        let decision = chain.evaluate(&request("a", "10.0.0.2")).await.unwrap();
        assert_eq!(decision.verdict.limiter.as_deref(), Some("per_user_agent"));
    }

    #[tokio::test]
    async fn test_rejection_releases_earlier_slots() {
        let clock = ManualClock::default();
        let slots = Arc::new(ConcurrencyLimiter::new(1, QueueSettings::disabled()));
        let window = fixed(&clock, 1, 60);
        let chain = LimiterChain::builder()
            .stage("concurrency", PartitionBy::Global, slots.clone())
            .stage("fixed", PartitionBy::Global, window)
            .build();
        let req = request("ua", "10.0.0.1");
        let key = PartitionKey::from("*");

        let admitted = chain.evaluate(&req).await.unwrap();
        assert!(admitted.verdict.admitted);
        assert_eq!(slots.available(&key), 0);
        drop(admitted);

        let rejected = chain.evaluate(&req).await.unwrap();
        assert_eq!(rejected.verdict.limiter.as_deref(), Some("fixed"));
        assert_eq!(slots.available(&key), 1);
    }

    #[tokio::test]
    async fn test_fail_open_skips_unavailable_stage() {
        let clock = ManualClock::default();
        let chain = LimiterChain::builder()
            .stage("broken", PartitionBy::Global, Arc::new(UnavailableLimiter))
            .stage("fixed", PartitionBy::Global, fixed(&clock, 1, 60))
            .build();
        let req = request("ua", "10.0.0.1");

        assert!(chain.evaluate(&req).await.unwrap().verdict.admitted);
        let decision = chain.evaluate(&req).await.unwrap();
        assert_eq!(decision.verdict.limiter.as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn test_fail_closed_surfaces_error() {
        let chain = LimiterChain::builder()
            .stage("broken", PartitionBy::Global, Arc::new(UnavailableLimiter))
            .failure_policy(FailurePolicy::FailClosed)
            .build();

        let err = chain.evaluate(&request("ua", "10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Unavailable(_)));
    }
}
