//! Token bucket used by services whose providers throttle per credential.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    state: Arc<Mutex<BucketState>>,
    rate: f64,
    burst: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    /// `rate` tokens per second, holding at most `burst` tokens.
    ///
    /// Non-positive or non-finite rates fall back to one token per second.
    pub fn new(rate: f64, burst: u32) -> Self {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        let burst = f64::from(burst.max(1));
        Self {
            state: Arc::new(Mutex::new(BucketState {
                tokens: burst,
                refilled_at: Instant::now(),
            })),
            rate,
            burst,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Wait until a token is available, then take it.
    ///
    /// Callers reserve their slot under the lock and sleep outside it, so
    /// concurrent waiters are released in arrival order.
    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock().await;
            self.refill(&mut state);
            state.tokens -= 1.0;
            if state.tokens >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-state.tokens / self.rate)
        };
        tokio::time::sleep(wait).await;
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens < 1.0 {
            return false;
        }
        state.tokens -= 1.0;
        true
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.refilled_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_then_paced() {
        let bucket = TokenBucket::new(20.0, 2);
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);

        let started = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        // Two tokens at 20/s need roughly 100ms of refill.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn invalid_rate_falls_back() {
        assert_eq!(TokenBucket::new(0.0, 1).rate(), 1.0);
        assert_eq!(TokenBucket::new(f64::NAN, 1).rate(), 1.0);
        assert_eq!(TokenBucket::new(0.2, 1).rate(), 0.2);
    }
}
