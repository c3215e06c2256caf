//! Token-bucket admission control.
//!
//! One bucket per session id, refilled continuously: at admission time
//! `tokens = min(burst, tokens + rate * elapsed)`. A request is admitted iff
//! a full token is available and consumes exactly one; denied requests
//! consume nothing. Updates happen inside a short critical section on the
//! caller's thread — no async, no background refill task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::warn;

use portcullis_types::config::RateLimitConfig;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-session token-bucket rate limiter.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    /// Build a limiter from configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_limits(config.requests_per_sec, config.burst)
    }

    /// Build a limiter with an explicit refill rate and burst capacity.
    pub fn with_limits(rate: f64, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate: rate.max(f64::MIN_POSITIVE),
            burst: f64::from(burst.max(1)),
        }
    }

    /// Admit or deny one request for the given session.
    ///
    /// New sessions start with a full bucket, so a fresh session can burst
    /// up to `burst` requests before the refill rate takes over.
    pub fn admit(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let bucket = buckets.entry(session_id.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + self.rate * elapsed).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            warn!(session = %session_id, "rate limit denied request");
            false
        }
    }

    /// Release bucket state for a session (called when the session is swept).
    pub fn forget(&self, session_id: &str) {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets.remove(session_id);
    }

    /// Number of tracked buckets.
    pub fn bucket_count(&self) -> usize {
        match self.buckets.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fresh_session_gets_full_burst() {
        let limiter = RateLimiter::with_limits(1.0, 5);
        let admitted = (0..5).filter(|_| limiter.admit("s1")).count();
        assert_eq!(admitted, 5);
        assert!(!limiter.admit("s1"));
    }

    #[test]
    fn admitted_requests_are_bounded_by_burst_in_a_tight_window() {
        // With a negligible refill rate, a burst of 1000 attempts admits
        // exactly the burst capacity.
        let limiter = RateLimiter::with_limits(0.001, 200);
        let admitted = (0..1000).filter(|_| limiter.admit("s1")).count();
        assert_eq!(admitted, 200);
    }

    #[test]
    fn denied_requests_do_not_consume_tokens() {
        let limiter = RateLimiter::with_limits(50.0, 2);
        assert!(limiter.admit("s1"));
        assert!(limiter.admit("s1"));
        // Hammering while empty must not push the bucket below zero;
        // one refill interval later a single token is available again.
        for _ in 0..100 {
            let _ = limiter.admit("s1");
        }
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.admit("s1"));
    }

    #[test]
    fn tokens_refill_continuously() {
        let limiter = RateLimiter::with_limits(100.0, 1);
        assert!(limiter.admit("s1"));
        assert!(!limiter.admit("s1"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(limiter.admit("s1"));
    }

    #[test]
    fn refill_never_exceeds_burst() {
        let limiter = RateLimiter::with_limits(1000.0, 3);
        for _ in 0..3 {
            assert!(limiter.admit("s1"));
        }
        std::thread::sleep(Duration::from_millis(50));
        // 50ms at 1000/s would be 50 tokens without the cap.
        let admitted = (0..10).filter(|_| limiter.admit("s1")).count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn sessions_have_independent_buckets() {
        let limiter = RateLimiter::with_limits(0.001, 1);
        assert!(limiter.admit("s1"));
        assert!(!limiter.admit("s1"));
        assert!(limiter.admit("s2"));
    }

    #[test]
    fn forget_resets_session_state() {
        let limiter = RateLimiter::with_limits(0.001, 1);
        assert!(limiter.admit("s1"));
        assert!(!limiter.admit("s1"));
        limiter.forget("s1");
        assert_eq!(limiter.bucket_count(), 0);
        // A recreated bucket starts full again.
        assert!(limiter.admit("s1"));
    }
}
