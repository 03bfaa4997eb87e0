use std::sync::Mutex;
use std::time::Instant;

use ahash::AHashMap;

/// Fractional token bucket. Refill is proportional to elapsed monotonic
/// time and clamped to capacity.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self { tokens: capacity, capacity, refill_per_sec, last_refill: Instant::now() }
    }

    /// Bucket for a requests-per-minute limit: ten seconds of steady state
    /// of burst credit, floor ten.
    pub fn for_rpm(rpm: u32) -> Self {
        let capacity = (f64::from(rpm) / 6.0).max(10.0);
        Self::new(capacity, f64::from(rpm) / 60.0)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume `n` tokens if available.
    pub fn try_take(&mut self, n: f64) -> bool {
        self.refill(Instant::now());
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

struct UserBucket {
    rpm: u32,
    bucket: TokenBucket,
}

/// Per-user request rate enforcement. Buckets are created on first use and
/// rebuilt if the user's configured rate changes on a catalog reload.
#[derive(Default)]
pub struct RequestLimiter {
    buckets: Mutex<AHashMap<String, UserBucket>>,
}

impl RequestLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One request for `username` at `rpm` requests/minute. `rpm == 0`
    /// bypasses the limiter entirely.
    pub fn allow(&self, username: &str, rpm: u32) -> bool {
        if rpm == 0 {
            return true;
        }
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let entry = buckets
            .entry(username.to_string())
            .or_insert_with(|| UserBucket { rpm, bucket: TokenBucket::for_rpm(rpm) });
        if entry.rpm != rpm {
            *entry = UserBucket { rpm, bucket: TokenBucket::for_rpm(rpm) };
        }
        entry.bucket.try_take(1.0)
    }
}
