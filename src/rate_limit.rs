use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Token-bucket limiter keyed by salted IP hash. Each key gets `max`
/// tokens refilled continuously over `window_secs`; one message spends
/// one token. Buckets are pruned once they refill completely.
pub struct RateLimiter {
    max: f64,
    refill_per_sec: f64,
    limit: u32,
    window_secs: u64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl RateLimiter {
    pub fn new(max: u32, window_secs: u64) -> Self {
        let capacity = max.max(1) as f64;
        RateLimiter {
            max: capacity,
            refill_per_sec: capacity / window_secs.max(1) as f64,
            limit: max.max(1),
            window_secs: window_secs.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// The configured (max, window_secs) pair, for error messages.
    pub fn limits(&self) -> (u32, u64) {
        (self.limit, self.window_secs)
    }

    /// Spend one token for `key`. Returns false when the bucket is empty.
    pub fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        // Full buckets carry no state worth keeping.
        buckets.retain(|_, b| {
            b.tokens + now.duration_since(b.updated).as_secs_f64() * self.refill_per_sec < self.max
        });

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.max,
            updated: now,
        });
        let elapsed = now.duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.max);
        bucket.updated = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_burst_up_to_max() {
        let limiter = RateLimiter::new(10, 10);
        for _ in 0..10 {
            assert!(limiter.check("ip-1"));
        }
        assert!(!limiter.check("ip-1"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(2, 10);
        assert!(limiter.check("ip-1"));
        assert!(limiter.check("ip-1"));
        assert!(!limiter.check("ip-1"));
        assert!(limiter.check("ip-2"));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(5, 1);
        for _ in 0..5 {
            assert!(limiter.check("ip-1"));
        }
        assert!(!limiter.check("ip-1"));
        // 5 tokens per second → one token back within ~250ms.
        std::thread::sleep(std::time::Duration::from_millis(250));
        assert!(limiter.check("ip-1"));
    }
}
