//! Per-peer token-bucket rate limiting.
//!
//! The engine only consumes `allow(peer, tokens)`: a rejected request maps
//! to a 429 before it is ever queued.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn try_acquire(&mut self, needed: f64, capacity: f64, refill_rate: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        // Refill tokens
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    /// None disables limiting entirely.
    config: Option<(f64, f64)>, // (refill per second, burst capacity)
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        Self {
            config: Some((f64::from(requests_per_second), f64::from(burst))),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            config: None,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Charge `tokens` against the peer's bucket.
    #[must_use]
    pub fn allow(&self, peer: IpAddr, tokens: u32) -> bool {
        let Some((rate, burst)) = self.config else {
            return true;
        };
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        buckets
            .entry(peer)
            .or_insert_with(|| TokenBucket::new(burst))
            .try_acquire(f64::from(tokens), burst, rate)
    }
}
