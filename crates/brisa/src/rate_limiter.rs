//! Token buckets that throttle the bandwidth of all peers of the engine.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::time::{sleep_until, Instant};

/// Amounts are paid in slices of at most this much time, so a rate change
/// is applied within one slice.
pub const REFILL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct BucketState {
    /// When the tokens reserved so far are all paid for.
    paid_until: Instant,
}

/// A bucket of byte tokens that accrue at `rate` per second. Tokens are not
/// saved while the bucket is idle, and a caller only gets its tokens once the
/// time to accrue them has passed. So the bytes granted in any window never
/// exceed `rate` times its length, plus the one slice that was being paid
/// when the window opened. A rate of 0 means no limit.
#[derive(Debug)]
pub struct TokenBucket {
    rate: AtomicU64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate),
            state: Mutex::new(BucketState { paid_until: Instant::now() }),
        }
    }

    /// Bytes per second, 0 is unlimited.
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Change the rate, it is applied to the next slice.
    pub fn set_rate(&self, rate: u64) {
        self.rate.store(rate, Ordering::Relaxed);
    }

    /// Bytes that accrue in one [`REFILL_INTERVAL`].
    fn slice(rate: u64) -> u64 {
        let per_interval =
            rate as u128 * REFILL_INTERVAL.as_millis() / 1000;
        (per_interval as u64).max(1)
    }

    /// Time for `amount` tokens to accrue, rounded up.
    fn cost(amount: u64, rate: u64) -> Duration {
        let nanos = (amount as u128 * 1_000_000_000).div_ceil(rate as u128);
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    /// Take `amount` tokens without waiting. Returns when they are paid
    /// for, the caller must not transfer more before that. `None` when there
    /// is no limit.
    pub fn reserve(&self, amount: u64) -> Option<Instant> {
        let rate = self.rate();
        if rate == 0 || amount == 0 {
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = state.paid_until.max(Instant::now());
        state.paid_until = from + Self::cost(amount, rate);
        Some(state.paid_until)
    }

    /// Wait until `amount` bytes may be transferred. Amounts larger than a
    /// slice are paid one slice at a time.
    pub async fn acquire(&self, mut amount: u64) {
        while amount > 0 {
            let rate = self.rate();
            if rate == 0 {
                return;
            }
            let want = amount.min(Self::slice(rate));
            if let Some(paid_at) = self.reserve(want) {
                sleep_until(paid_at).await;
            }
            amount -= want;
        }
    }
}

/// The upload and download buckets, shared by every peer of the engine.
#[derive(Debug)]
pub struct RateLimiter {
    pub upload: TokenBucket,
    pub download: TokenBucket,
}

impl RateLimiter {
    pub fn new(upload_limit: u64, download_limit: u64) -> Self {
        Self {
            upload: TokenBucket::new(upload_limit),
            download: TokenBucket::new(download_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Bytes that were acquired in chunks of `chunk`, until `window` elapsed.
    async fn acquired_within(
        bucket: &TokenBucket,
        chunk: u64,
        window: Duration,
    ) -> u64 {
        let start = Instant::now();
        let mut total = 0;
        loop {
            bucket.acquire(chunk).await;
            if start.elapsed() >= window {
                return total;
            }
            total += chunk;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_rate() {
        let bucket = TokenBucket::new(100_000);

        let first = acquired_within(&bucket, 1000, Duration::from_secs(1)).await;
        assert!(first <= 100_000, "{first}");
        assert!(first >= 80_000, "{first}");

        for _ in 0..3 {
            let n = acquired_within(&bucket, 1000, Duration::from_secs(1)).await;
            assert!(n <= 100_000, "{n}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shared_between_tasks() {
        let bucket = Arc::new(TokenBucket::new(50_000));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bucket = bucket.clone();
                tokio::spawn(async move {
                    acquired_within(&bucket, 500, Duration::from_secs(2)).await
                })
            })
            .collect();

        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(total <= 2 * 50_000, "{total}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_is_not_saved_up() {
        let bucket = TokenBucket::new(100_000);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let n = acquired_within(&bucket, 1000, Duration::from_secs(1)).await;
        assert!(n <= 100_000, "{n}");

        // a window that opens right after a grant
        bucket.acquire(1000).await;
        let n = acquired_within(&bucket, 1000, Duration::from_secs(1)).await;
        assert!(n <= 100_000, "{n}");
    }

    #[tokio::test(start_paused = true)]
    async fn rates_below_ten_bytes() {
        let bucket = TokenBucket::new(5);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let n = acquired_within(&bucket, 1, Duration::from_secs(1)).await;
        assert!(n <= 5, "{n}");
        let n = acquired_within(&bucket, 1, Duration::from_secs(2)).await;
        assert!((8..=10).contains(&n), "{n}");
    }

    #[tokio::test(start_paused = true)]
    async fn large_requests_are_deferred() {
        // 10 slices of 1000 tokens
        let bucket = TokenBucket::new(10_000);
        let start = Instant::now();
        bucket.acquire(10_000).await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn reservations_queue_up() {
        let bucket = TokenBucket::new(16_384);
        let start = Instant::now();

        let first = bucket.reserve(16_384).unwrap();
        let second = bucket.reserve(8192).unwrap();
        assert_eq!(first - start, Duration::from_secs(1));
        assert_eq!(second - start, Duration::from_millis(1500));

        // acquire waits behind the reservations
        bucket.acquire(1).await;
        assert!(start.elapsed() > Duration::from_millis(1500));

        bucket.set_rate(0);
        assert!(bucket.reserve(1 << 30).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_is_unlimited() {
        let bucket = TokenBucket::new(0);
        let start = Instant::now();
        bucket.acquire(1 << 40).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_changes_at_runtime() {
        let bucket = TokenBucket::new(10_000);
        let n = acquired_within(&bucket, 100, Duration::from_secs(1)).await;
        assert!(n <= 10_000);

        bucket.set_rate(100_000);
        let n = acquired_within(&bucket, 100, Duration::from_secs(1)).await;
        assert!(n > 10_000 && n <= 100_000, "{n}");

        bucket.set_rate(0);
        let start = Instant::now();
        bucket.acquire(1_000_000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
