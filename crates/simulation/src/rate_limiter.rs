//! Token-bucket rate limiting in simulated time.
//!
//! Used by API components with a `rateLimit`, by gateways (globally or per
//! user) and by streams for their write rate.

use archsim_types::SimTime;
use std::collections::BTreeMap;

/// Token bucket state.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    /// Current number of tokens available.
    tokens: f64,
    /// Maximum tokens (bucket capacity).
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last time we updated the bucket.
    last_update: SimTime,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: f64, refill_rate: f64, now: SimTime) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: refill_rate.max(0.0),
            last_update: now,
        }
    }

    /// Try to consume one token. Returns true if allowed, false if rate limited.
    pub fn try_acquire(&mut self, now: SimTime) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self, now: SimTime) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn refill(&mut self, now: SimTime) {
        let elapsed = now.micros_since(self.last_update) as f64 / 1_000_000.0;
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = self.last_update.max(now);
    }
}

/// One bucket per key (e.g. per user), created full on first use.
#[derive(Debug, Clone, Default)]
pub struct KeyedRateLimiter {
    capacity: f64,
    refill_rate: f64,
    buckets: BTreeMap<String, TokenBucket>,
}

impl KeyedRateLimiter {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            buckets: BTreeMap::new(),
        }
    }

    /// Check if a request for `key` should be allowed.
    pub fn try_acquire(&mut self, key: &str, now: SimTime) -> bool {
        let (capacity, rate) = (self.capacity, self.refill_rate);
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(capacity, rate, now))
            .try_acquire(now)
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}
