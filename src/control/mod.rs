pub mod rate_limiter;
pub mod retry;

pub use rate_limiter::RateLimiter;
pub use retry::{Attempted, RetryPolicy};
