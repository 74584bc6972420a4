use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const VISITOR_IDLE_EVICTION: Duration = Duration::from_secs(3 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Token bucket for one client IP: refilled at `rate_per_second`, capped at
/// `burst` tokens.
struct TokenBucket {
    tokens: f64,
    rate_per_second: f64,
    burst: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_second: u64, burst: u64) -> Self {
        Self {
            tokens: burst as f64,
            rate_per_second: rate_per_second as f64,
            burst: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_second).min(self.burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Visitor {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Per-IP rate limiter. Two requests from the same client IP share one
/// bucket; a cleanup task evicts buckets idle for several minutes.
pub struct RateLimiter {
    visitors: Mutex<HashMap<String, Visitor>>,
    rate_per_second: u64,
    burst: u64,
}

impl RateLimiter {
    pub fn new(rate_per_second: u64, burst: Option<u64>) -> Self {
        Self {
            visitors: Mutex::new(HashMap::new()),
            rate_per_second: rate_per_second.max(1),
            burst: burst.unwrap_or(rate_per_second).max(1),
        }
    }

    /// Look up (or create) the caller's bucket and take one token from it.
    pub fn allow(&self, ip: &str) -> bool {
        let mut visitors = self.visitors.lock().unwrap();
        let visitor = visitors.entry(ip.to_string()).or_insert_with(|| Visitor {
            bucket: TokenBucket::new(self.rate_per_second, self.burst),
            last_seen: Instant::now(),
        });
        visitor.last_seen = Instant::now();
        visitor.bucket.allow()
    }

    pub fn clean_old_visitors(&self) {
        let mut visitors = self.visitors.lock().unwrap();
        let before = visitors.len();
        visitors.retain(|_, visitor| visitor.last_seen.elapsed() < VISITOR_IDLE_EVICTION);
        let evicted = before - visitors.len();
        if evicted > 0 {
            debug!("Evicted {} idle rate-limit visitors", evicted);
        }
    }
}

pub async fn cleanup_loop(limiter: Arc<RateLimiter>) {
    loop {
        tokio::time::sleep(CLEANUP_INTERVAL).await;
        limiter.clean_old_visitors();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_reject() {
        let limiter = RateLimiter::new(2, Some(2));
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
    }

    #[test]
    fn buckets_are_per_ip() {
        let limiter = RateLimiter::new(1, Some(1));
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
        assert!(limiter.allow("5.6.7.8"));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(1000, Some(1));
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
        std::thread::sleep(Duration::from_millis(10));
        assert!(limiter.allow("1.2.3.4"));
    }
}
