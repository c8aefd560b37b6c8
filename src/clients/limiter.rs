use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// A token bucket handing out request permits, shared across tasks.
///
/// `acquire` waits until a permit is available; the lock is dropped before
/// sleeping so other waiters can refill in the meantime.
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<TokenBucket>>,
}

struct TokenBucket {
    /// Maximum number of stored permits; controls burstiness.
    capacity: f64,
    tokens: f64,
    /// Permits added per second.
    rate: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// A bucket admitting `limit` requests per minute.
    #[must_use]
    pub fn per_minute(limit: u32) -> Self {
        Self::new(f64::from(limit), f64::from(limit) / 60.0)
    }

    /// A bucket admitting `limit` requests per second.
    #[must_use]
    pub fn per_second(limit: u32) -> Self {
        Self::new(f64::from(limit), f64::from(limit))
    }

    fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(TokenBucket {
                capacity,
                tokens: capacity,
                rate: rate_per_sec,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Takes one permit, waiting as long as necessary.
    pub async fn acquire(&self) {
        loop {
            let mut bucket = self.state.lock().await;
            bucket.refill();

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }

            let wait = Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate);
            drop(bucket);
            tokio::time::sleep(wait).await;
        }
    }

    /// Empties the bucket and pushes the next refill out by `delay`; used
    /// after a 429 so the whole client backs off at once.
    pub async fn penalize(&self, delay: Duration) {
        let mut bucket = self.state.lock().await;
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now() + delay;
    }
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Two stacked buckets; both must admit before a request goes out.
#[derive(Clone)]
pub struct DualRateLimiter {
    per_second: RateLimiter,
    per_minute: RateLimiter,
}

impl DualRateLimiter {
    #[must_use]
    pub fn new(per_second: u32, per_minute: u32) -> Self {
        Self {
            per_second: RateLimiter::per_second(per_second),
            per_minute: RateLimiter::per_minute(per_minute),
        }
    }

    pub async fn acquire(&self) {
        self.per_minute.acquire().await;
        self.per_second.acquire().await;
    }

    pub async fn penalize(&self, delay: Duration) {
        self.per_second.penalize(delay).await;
        self.per_minute.penalize(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_is_immediate() {
        let limiter = RateLimiter::per_second(5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_refill() {
        let limiter = RateLimiter::per_second(1);
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
