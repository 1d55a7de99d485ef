use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

// Type alias for the rate limiter to simplify signatures
type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Token bucket shared by every call a connector makes to one exchange
///
/// Cloneable; all clones draw from the same bucket.
#[derive(Clone)]
pub struct RequestLimiter {
    limiter: Arc<DirectRateLimiter>,
}

impl RequestLimiter {
    /// Allow `requests_per_second` calls per second (at least one)
    pub fn per_second(requests_per_second: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
        }
    }

    /// Wait until a request may be sent
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token without waiting; false when the bucket is empty
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
