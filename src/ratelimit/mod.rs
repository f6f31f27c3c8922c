//! Request budget bookkeeping and timing policy.

mod backoff;
mod limiter;
mod policy;

pub use backoff::BackoffTimer;
pub use limiter::{LimiterSnapshot, RateLimiter};
pub use policy::LimiterPolicy;
