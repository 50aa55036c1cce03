//! Failure-handling primitives shared by the OAuth and federation layers.

pub mod rate_limiter;
pub mod retry;

pub use rate_limiter::KeyedRateLimiter;
pub use retry::{RetryPolicy, with_retry};
