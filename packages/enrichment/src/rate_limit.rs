//! Fixed-interval pacing shared by all workers of a batch.
//!
//! One limiter gates page fetches and a separate one gates completion calls.

use std::num::NonZeroU32;

use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio_util::sync::CancellationToken;

type DirectLimiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Paced gate. Callers hold it behind an `Arc` and call [`acquire`](Self::acquire)
/// before each external request.
///
/// Permits are spaced evenly at `1 / rate` seconds with no burst, so `N + 1`
/// concurrent acquires at `N` per second take at least one second.
pub struct RateLimiter {
    inner: Option<DirectLimiter>,
    per_second: u32,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("per_second", &self.per_second)
            .finish()
    }
}

impl RateLimiter {
    /// Limiter allowing `rate` calls per second. A rate of 0 never waits.
    pub fn per_second(rate: u32) -> Self {
        match NonZeroU32::new(rate) {
            Some(rate) => {
                let quota = Quota::per_second(rate).allow_burst(NonZeroU32::MIN);
                Self {
                    inner: Some(GovernorLimiter::direct(quota)),
                    per_second: rate.get(),
                }
            }
            None => Self::unlimited(),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            inner: None,
            per_second: 0,
        }
    }

    /// Configured ceiling; 0 means unlimited.
    pub fn rate(&self) -> u32 {
        self.per_second
    }

    /// Wait until the caller may proceed.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up once `cancel` fires.
    ///
    /// Returns `false` when cancelled before a permit was granted. A permit
    /// that is already available is taken even if `cancel` has fired.
    pub async fn acquire_until(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = self.acquire() => true,
            _ = cancel.cancelled() => false,
        }
    }
}
