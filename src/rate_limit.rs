use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Feature-wide limiter: at most `max_requests` per `time_window`, with
/// bursts up to the full allowance. Callers that find it empty are
/// rejected straight away rather than queued.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
    rate: f64,
    capacity: f64,
}

impl RateLimiter {
    pub fn new(max_requests: u32, time_window: Duration) -> Self {
        let capacity = f64::from(max_requests.max(1));
        let window = time_window.as_secs_f64().max(f64::EPSILON);
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(capacity))),
            rate: capacity / window,
            capacity,
        }
    }

    pub async fn check(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        bucket.try_consume(self.rate, self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_burst_up_to_max_requests() {
        let limiter = RateLimiter::new(3, Duration::from_secs(3600));
        for _ in 0..3 {
            assert!(limiter.check().await);
        }
        assert!(!limiter.check().await);
    }

    #[tokio::test]
    async fn refills_over_the_window() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check().await);
        assert!(!limiter.check().await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.check().await);
    }

    #[tokio::test]
    async fn clones_share_one_budget() {
        let limiter = RateLimiter::new(1, Duration::from_secs(3600));
        let other = limiter.clone();
        assert!(limiter.check().await);
        assert!(!other.check().await);
    }
}
