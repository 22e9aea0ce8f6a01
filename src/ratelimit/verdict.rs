//! Admission verdicts and the leases held by admitted requests.

use std::time::Duration;

use super::concurrency::SlotGuard;

/// Why a single limiter turned a request away.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// How long the client should wait before retrying, if known
    pub retry_after: Option<Duration>,
    /// Human-readable explanation citing the exceeded limit
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            reason: reason.into(),
        }
    }
}

/// Resources an admitted request holds until it completes.
///
/// Dropping the lease releases any concurrency slot it carries.
#[derive(Debug, Default)]
pub struct Lease {
    slot: Option<SlotGuard>,
}

impl Lease {
    /// A lease that holds nothing.
    pub fn none() -> Self {
        Self { slot: None }
    }

    pub(crate) fn slot(guard: SlotGuard) -> Self {
        Self { slot: Some(guard) }
    }

    /// Whether this lease holds a concurrency slot.
    pub fn holds_slot(&self) -> bool {
        self.slot.is_some()
    }
}

/// Result of asking one limiter to admit a request.
#[derive(Debug)]
pub enum LimiterOutcome {
    Admitted(Lease),
    Rejected(Rejection),
}

impl LimiterOutcome {
    pub fn admitted() -> Self {
        LimiterOutcome::Admitted(Lease::none())
    }

    pub fn rejected(reason: impl Into<String>, retry_after: Option<Duration>) -> Self {
        LimiterOutcome::Rejected(Rejection::new(reason, retry_after))
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, LimiterOutcome::Admitted(_))
    }
}

/// The final decision for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub admitted: bool,
    pub retry_after: Option<Duration>,
    pub reason: String,
    /// Name of the limiter that rejected the request
    pub limiter: Option<String>,
}

impl Verdict {
    /// An admitting verdict.
    pub fn admit() -> Self {
        Self {
            admitted: true,
            retry_after: None,
            reason: String::new(),
            limiter: None,
        }
    }

    /// A rejecting verdict attributed to `limiter`.
    pub fn reject(limiter: impl Into<String>, rejection: Rejection) -> Self {
        Self {
            admitted: false,
            retry_after: rejection.retry_after,
            reason: rejection.reason,
            limiter: Some(limiter.into()),
        }
    }

    /// Retry-after rounded up to whole seconds, at least one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|wait| {
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            secs.max(1)
        })
    }
}
