//! Rate limiting algorithms, partitioning and composition.

mod chain;
mod clock;
mod concurrency;
mod counter;
mod fixed_window;
mod limiter;
mod partition;
mod policy;
mod queue;
mod route;
mod sliding_window;
mod token_bucket;
mod verdict;

pub use chain::{ChainDecision, ChainStage, FailurePolicy, LimiterChain, LimiterChainBuilder};
pub use clock::{Clock, ManualClock, RuntimeClock, SharedClock};
pub use concurrency::{ConcurrencyLimiter, SlotGuard};
pub use counter::{CounterEntry, CounterStore};
pub use fixed_window::FixedWindowLimiter;
pub use limiter::{Algorithm, Limiter};
pub use partition::{normalize_route, PartitionBy, PartitionKey, RequestDescriptor, UNKNOWN_CLIENT};
pub use policy::{LimiterConfig, MAX_SEGMENTS_PER_WINDOW};
pub use queue::{QueueOrder, QueueSettings};
pub use route::{RouteRateLimiter, ROUTE_LIMITER_NAME};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;
pub use verdict::{Lease, LimiterOutcome, Rejection, Verdict};
