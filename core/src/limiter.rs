use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;

struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn full(burst: f64, now: Instant) -> Self {
        Self { tokens: burst, last: now }
    }

    fn take(&mut self, now: Instant, rate: f64, burst: f64) -> bool {
        if now > self.last {
            let elapsed = now.duration_since(self.last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate).min(burst);
            self.last = now;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-key token buckets, refilled lazily from elapsed time on each check.
///
/// At most `max_keys` buckets are kept; the least recently used one is
/// evicted when a new key arrives, and comes back with a full bucket.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    buckets: Mutex<LruCache<String, Bucket>>,
}

impl RateLimiter {
    /// `rate` tokens per second, bursts of up to `burst`.
    pub fn new(rate: f64, burst: u32, max_keys: usize) -> Self {
        let cap = NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN);
        Self {
            rate: rate.max(0.0),
            burst: f64::from(burst),
            buckets: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Try to admit one request for `key`.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// [`allow`](Self::allow) with an explicit clock reading.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(key) {
            return bucket.take(now, self.rate, self.burst);
        }
        let mut bucket = Bucket::full(self.burst, now);
        let admitted = bucket.take(now, self.rate, self.burst);
        buckets.put(key.to_string(), bucket);
        admitted
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_then_one_per_second() {
        let rl = RateLimiter::new(1.0, 5, 100);
        let t0 = Instant::now();
        for _ in 0..5 {
            assert!(rl.allow_at("10.0.0.1", t0));
        }
        assert!(!rl.allow_at("10.0.0.1", t0));

        let t1 = t0 + Duration::from_secs(1);
        assert!(rl.allow_at("10.0.0.1", t1));
        assert!(!rl.allow_at("10.0.0.1", t1));
    }

    #[test]
    fn rejections_do_not_consume() {
        let rl = RateLimiter::new(2.0, 1, 100);
        let t0 = Instant::now();
        assert!(rl.allow_at("k", t0));
        for _ in 0..10 {
            assert!(!rl.allow_at("k", t0 + Duration::from_millis(100)));
        }
        assert!(rl.allow_at("k", t0 + Duration::from_millis(600)));
    }

    #[test]
    fn keys_are_independent() {
        let rl = RateLimiter::new(1.0, 1, 100);
        let t0 = Instant::now();
        assert!(rl.allow_at("a", t0));
        assert!(!rl.allow_at("a", t0));
        assert!(rl.allow_at("b", t0));
    }

    #[test]
    fn tracked_keys_are_bounded() {
        let rl = RateLimiter::new(1.0, 1, 3);
        let t0 = Instant::now();
        for i in 0..10 {
            rl.allow_at(&format!("client-{i}"), t0);
        }
        assert_eq!(rl.tracked_keys(), 3);
        // Evicted key starts over with a full bucket.
        assert!(rl.allow_at("client-0", t0));
    }
}
