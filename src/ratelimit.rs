//! Token-bucket rate limiter for remote API quota budgets.
//!
//! The remote service accounts calls in quota units rather than requests, so
//! callers charge a per-call cost before issuing each call. Waiters queue on
//! an internal async mutex, which keeps ordering roughly first-come
//! first-served without guaranteeing it.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Returned when the cancellation token fires while waiting for tokens.
#[derive(Debug, thiserror::Error)]
#[error("cancelled while waiting for rate limit tokens")]
pub struct Cancelled;

struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, rate: f64, burst: f64) {
        let elapsed = now.duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.updated = now;
    }
}

pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    /// Tokens added per second.
    rate: f64,
    /// Bucket depth; the largest cost that can ever be satisfied.
    burst: f64,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: burst,
                updated: Instant::now(),
            }),
            rate,
            burst,
        }
    }

    /// Take `cost` tokens, suspending until they are available or `cancel`
    /// fires. `cost` must not exceed the configured burst.
    pub async fn acquire(&self, cost: u32, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let cost = f64::from(cost).min(self.burst);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(Instant::now(), self.rate, self.burst);
                if bucket.tokens >= cost {
                    bucket.tokens -= cost;
                    return Ok(());
                }
                Duration::from_secs_f64((cost - bucket.tokens) / self.rate)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
