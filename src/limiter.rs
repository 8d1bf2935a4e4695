use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::debug;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Aggregate throughput gate for all receive paths.
///
/// Token bucket with a one-second replenish window; a `None` limit disables
/// throttling entirely. Also carries the cumulative received-byte counter the
/// progress reporter polls, so reporting never touches chunk state.
pub struct RateGate {
    limiter: Option<DirectLimiter>,
    burst: u32,
    received: AtomicU64,
}

impl RateGate {
    pub fn new(bytes_per_sec: Option<NonZeroU32>) -> Self {
        Self {
            limiter: bytes_per_sec.map(|limit| RateLimiter::direct(Quota::per_second(limit))),
            burst: bytes_per_sec.map_or(0, NonZeroU32::get),
            received: AtomicU64::new(0),
        }
    }

    /// Block the calling receive path until `n` bytes fit under the ceiling.
    ///
    /// Requests larger than one bucket are fed through in bucket-sized
    /// slices, so no single wait exceeds one replenish interval per slice and
    /// the reporting task is never starved.
    pub async fn throttle(&self, n: usize) {
        let Some(limiter) = &self.limiter else {
            return;
        };

        let mut left = n as u64;
        while left > 0 {
            let slice = left.min(self.burst as u64) as u32;
            // Safe: slice >= 1 and <= burst, so the quota can always cover it.
            let Some(cells) = NonZeroU32::new(slice) else {
                break;
            };
            if limiter.until_n_ready(cells).await.is_err() {
                debug!(slice, "rate gate slice exceeded bucket capacity");
                break;
            }
            left -= slice as u64;
        }
    }

    /// Count bytes as received; called once per successful positional write.
    pub fn add(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}
