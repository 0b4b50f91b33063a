//! `queue` crate — scheduling primitives shared by the engine: the run
//! dispatch priority queue and the per-key admission limiters used to
//! throttle triggers.

pub mod error;
pub mod priority_queue;
pub mod rate_limiter;

pub use error::QueueError;
pub use priority_queue::{PriorityQueue, QueueEntry};
pub use rate_limiter::{RateLimitDecision, SlidingWindowLimiter, TokenBucketLimiter};
