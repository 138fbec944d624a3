//! Process-local token bucket.
//!
//! Paces the watcher's long-poll iterations so rapid successive changes do
//! not stampede the backend. Steady rate plus burst capacity, with a
//! separately configurable initial fill so freshly started watchers get a
//! few quick rounds before settling to the steady rate.

use std::time::Duration;

use tokio::time::Instant;

/// Awaitable token bucket. Not shared; each watcher loop owns one.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `refill_rate` tokens per second up to `capacity`, starting with
    /// `initial_tokens` in the bucket.
    pub(crate) fn new(refill_rate: f64, capacity: u32, initial_tokens: u32) -> Self {
        Self {
            tokens: f64::from(initial_tokens.min(capacity)),
            capacity: f64::from(capacity),
            refill_rate: refill_rate.max(f64::MIN_POSITIVE),
            last_refill: Instant::now(),
        }
    }

    /// Take one token, sleeping until the refill makes one available.
    pub(crate) async fn acquire(&mut self) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let deficit = 1.0 - self.tokens;
            let wait_secs = deficit / self.refill_rate;
            tokio::time::sleep(Duration::from_secs_f64(wait_secs)).await;
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_secs = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed_secs * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}
