//! The admission stage every request passes through before its handler.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::response::{dispatch, Dispatch, RejectionResponse};
use crate::config::{normalize_policy_name, AdmissionConfig, EndpointConfig};
use crate::ratelimit::{
    normalize_route, FailurePolicy, Lease, Limiter, LimiterChain, PartitionBy,
    RequestDescriptor, RouteRateLimiter, SharedClock, Verdict,
};

/// An admitted request and the leases it holds.
///
/// Concurrency slots stay occupied until the admission is dropped.
#[derive(Debug)]
pub struct Admission {
    pub verdict: Verdict,
    pub leases: Vec<Lease>,
    /// The route is exempt and no limiter was consulted
    pub exempt: bool,
}

/// Result of running a request through the admission stage.
#[derive(Debug)]
pub enum AdmissionOutcome {
    Admitted(Admission),
    Rejected(RejectionResponse),
}

impl AdmissionOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionOutcome::Admitted(_))
    }

    pub fn rejection(&self) -> Option<&RejectionResponse> {
        match self {
            AdmissionOutcome::Rejected(response) => Some(response),
            AdmissionOutcome::Admitted(_) => None,
        }
    }
}

/// Applies, in order: endpoint exemption, the global chain, the endpoint's
/// named policy and the route-scoped limiter.
///
/// Every stage must admit. Limiters are built once from configuration and
/// never change afterwards.
pub struct AdmissionService {
    chain: LimiterChain,
    policies: HashMap<String, LimiterChain>,
    endpoints: HashMap<String, EndpointConfig>,
    route_limiter: RouteRateLimiter,
    failure_policy: FailurePolicy,
}

impl AdmissionService {
    /// Build every configured limiter.
    ///
    /// Invalid or disabled limiters are left out with a warning; the rest
    /// of the configuration still applies.
    pub fn from_config(config: &AdmissionConfig, clock: SharedClock) -> Self {
        let mut chain = LimiterChain::builder().failure_policy(config.failure_policy);
        for stage in &config.chain {
            if !stage.limiter.enabled {
                info!(stage = %stage.name, "Chain limiter disabled");
                continue;
            }
            match stage.limiter.build(&clock) {
                Ok(limiter) => chain = chain.stage(&stage.name, stage.limiter.partition, limiter),
                Err(err) => {
                    warn!(stage = %stage.name, error = %err, "Skipping invalid chain limiter")
                }
            }
        }

        let mut policies = HashMap::with_capacity(config.policies.len());
        for (name, policy) in &config.policies {
            if !policy.enabled {
                info!(policy = %name, "Policy disabled");
                continue;
            }
            match policy.build(&clock) {
                Ok(limiter) => {
                    policies.insert(
                        normalize_policy_name(name),
                        single_stage(name, policy.partition, limiter, config.failure_policy),
                    );
                }
                Err(err) => warn!(policy = %name, error = %err, "Skipping invalid policy"),
            }
        }

        let mut endpoints = HashMap::with_capacity(config.endpoints.len());
        for (route, endpoint) in &config.endpoints {
            let mut endpoint = endpoint.clone();
            endpoint.policy = endpoint.policy.as_deref().map(normalize_policy_name);
            if let Some(name) = &endpoint.policy {
                if !policies.contains_key(name) {
                    warn!(route = %route, policy = %name, "Endpoint references an unavailable policy");
                    endpoint.policy = None;
                }
            }
            endpoints.insert(normalize_route(route), endpoint);
        }

        let service = Self {
            chain: chain.build(),
            policies,
            endpoints,
            route_limiter: RouteRateLimiter::new(clock, config.rate_limit.clone()),
            failure_policy: config.failure_policy,
        };
        info!(
            chain = ?service.chain_names(),
            policies = service.policies.len(),
            endpoints = service.endpoints.len(),
            route_limiting = service.route_limiter.is_enabled(),
            "Admission service configured"
        );
        service
    }

    /// Replace the global chain.
    pub fn with_chain(mut self, chain: LimiterChain) -> Self {
        self.chain = chain;
        self
    }

    /// Register a named policy that endpoints may bind to.
    pub fn with_policy(
        mut self,
        name: impl Into<String>,
        partition: PartitionBy,
        limiter: Arc<dyn Limiter>,
    ) -> Self {
        let name = name.into();
        let chain = single_stage(&name, partition, limiter, self.failure_policy);
        self.policies.insert(normalize_policy_name(&name), chain);
        self
    }

    /// Bind `route` to a set of limiters.
    pub fn with_endpoint(mut self, route: &str, mut endpoint: EndpointConfig) -> Self {
        endpoint.policy = endpoint.policy.as_deref().map(normalize_policy_name);
        self.endpoints.insert(normalize_route(route), endpoint);
        self
    }

    /// Names of the global chain stages in evaluation order.
    pub fn chain_names(&self) -> Vec<&str> {
        self.chain.stage_names()
    }

    /// Decide whether `request` may proceed.
    #[instrument(skip(self, request), fields(route = %request.route))]
    pub async fn check(&self, request: &RequestDescriptor) -> AdmissionOutcome {
        let endpoint = self.endpoints.get(&request.normalized_route());
        if endpoint.is_some_and(|e| e.exempt) {
            debug!("Route exempt from rate limiting");
            return AdmissionOutcome::Admitted(Admission {
                verdict: Verdict::admit(),
                leases: Vec::new(),
                exempt: true,
            });
        }

        let mut leases = Vec::new();

        if let Err(response) = run_chain(&self.chain, request, &mut leases).await {
            return AdmissionOutcome::Rejected(response);
        }

        let policy = endpoint
            .and_then(|e| e.policy.as_deref())
            .and_then(|name| self.policies.get(name));
        if let Some(policy) = policy {
            if let Err(response) = run_chain(policy, request, &mut leases).await {
                return AdmissionOutcome::Rejected(response);
            }
        }

        if endpoint.is_some_and(|e| e.route_scoped) {
            if let Dispatch::Reject(response) = dispatch(&self.route_limiter.check(request)) {
                return AdmissionOutcome::Rejected(response);
            }
        }

        AdmissionOutcome::Admitted(Admission {
            verdict: Verdict::admit(),
            leases,
            exempt: false,
        })
    }

    /// Run `handler` if `request` is admitted, holding the request's
    /// concurrency slots until the handler finishes or is dropped.
    pub async fn guard<F, Fut, T>(
        &self,
        request: &RequestDescriptor,
        handler: F,
    ) -> std::result::Result<T, RejectionResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.check(request).await {
            AdmissionOutcome::Admitted(admission) => {
                let output = handler().await;
                drop(admission);
                Ok(output)
            }
            AdmissionOutcome::Rejected(response) => Err(response),
        }
    }

    /// Reclaim idle state in every limiter.
    pub fn purge_expired(&self) -> usize {
        self.chain.purge_expired()
            + self
                .policies
                .values()
                .map(LimiterChain::purge_expired)
                .sum::<usize>()
            + self.route_limiter.purge_expired()
    }
}

fn single_stage(
    name: &str,
    partition: PartitionBy,
    limiter: Arc<dyn Limiter>,
    failure_policy: FailurePolicy,
) -> LimiterChain {
    LimiterChain::builder()
        .stage(name, partition, limiter)
        .failure_policy(failure_policy)
        .build()
}

/// Evaluate `chain`, collecting its leases or producing the response that
/// ends the request.
async fn run_chain(
    chain: &LimiterChain,
    request: &RequestDescriptor,
    leases: &mut Vec<Lease>,
) -> std::result::Result<(), RejectionResponse> {
    if chain.is_empty() {
        return Ok(());
    }
    match chain.evaluate(request).await {
        Ok(decision) => match dispatch(&decision.verdict) {
            Dispatch::PassThrough => {
                leases.extend(decision.leases);
                Ok(())
            }
            Dispatch::Reject(response) => Err(response),
        },
        Err(err) => {
            error!(error = %err, "Limiter failed, refusing request");
            Err(RejectionResponse::internal_error(&err))
        }
    }
}
