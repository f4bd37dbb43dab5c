use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

/// Token bucket for rate limiting.
///
/// Provides smooth rate limiting with a configurable refill rate and burst
/// capacity. Refill is computed lazily on access, so an idle bucket costs
/// nothing. Uses `parking_lot::Mutex` for sync-compatible locking; the
/// consume path never awaits.
pub struct TokenBucket {
    inner: Mutex<TokenBucketInner>,
    capacity: f64,
    refill_rate: f64, // tokens per second
}

struct TokenBucketInner {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a new token bucket.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of tokens (burst capacity)
    /// * `refill_rate` - Tokens added per second
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            inner: Mutex::new(TokenBucketInner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_rate,
        }
    }

    /// Try to consume `tokens` immediately.
    ///
    /// Returns true if the tokens were acquired, false otherwise.
    pub fn try_acquire(&self, tokens: f64) -> bool {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);

        trace!(
            "token bucket: {} tokens available, requesting {}",
            inner.tokens,
            tokens
        );

        if inner.tokens >= tokens {
            inner.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Current available tokens (for monitoring).
    pub fn available_tokens(&self) -> f64 {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        inner.tokens
    }

    fn refill(&self, inner: &mut TokenBucketInner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.refill_rate).min(self.capacity);
        inner.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_token_bucket_basic() {
        let bucket = TokenBucket::new(10.0, 5.0);

        assert!(bucket.try_acquire(5.0));
        assert!(bucket.try_acquire(5.0));

        assert!(!bucket.try_acquire(1.0));

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(bucket.try_acquire(1.0));
    }

    #[tokio::test]
    async fn test_token_bucket_refill() {
        let bucket = TokenBucket::new(10.0, 10.0);

        assert!(bucket.try_acquire(10.0));

        tokio::time::sleep(Duration::from_millis(500)).await;

        let available = bucket.available_tokens();
        assert!((4.0..=6.0).contains(&available));
    }

    #[test]
    fn test_token_bucket_caps_at_capacity() {
        let bucket = TokenBucket::new(2.0, 1000.0);

        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.available_tokens() <= 2.0);

        assert!(bucket.try_acquire(2.0));
        assert!(!bucket.try_acquire(2.0));
    }
}
