//! Per-address rate limiting middleware.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use crate::config::RateLimitConfig;
use crate::net::ConnectionInfo;
use crate::observability::metrics;
use crate::pipeline::{IncomingRequest, Middleware};
use crate::protocol::ErrorCode;

/// A simple token bucket rate limiter.
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_update: now,
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();

        // Refill tokens
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Buckets {
    by_ip: HashMap<IpAddr, TokenBucket>,
    swept_at: Option<Instant>,
}

impl Buckets {
    /// Drop buckets idle for a full refill window. Such a bucket is full
    /// again, so forgetting it changes no decision.
    fn sweep(&mut self, window: Duration, now: Instant) {
        let due = self
            .swept_at
            .map_or(true, |at| now.saturating_duration_since(at) >= window);
        if !due {
            return;
        }
        self.by_ip
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_update) < window);
        self.swept_at = Some(now);
    }
}

/// Token bucket per remote IP.
pub struct RateLimiter {
    buckets: Mutex<Buckets>,
    settings: ArcSwap<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
            settings: ArcSwap::from_pointee(config.clone()),
        }
    }

    /// New limits apply to fresh buckets; existing buckets are reset.
    pub fn update(&self, config: &RateLimitConfig) {
        self.settings.store(std::sync::Arc::new(config.clone()));
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_ip
            .clear();
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let settings = self.settings.load();
        if !settings.enabled {
            return true;
        }
        let rps = settings.requests_per_second as f64;
        let burst = settings.burst_size as f64;

        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if rps > 0.0 {
            buckets.sweep(Duration::from_secs_f64(burst / rps), now);
        }
        buckets
            .by_ip
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(burst, now))
            .try_acquire(burst, rps, now)
    }

    pub fn tracked_addresses(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).by_ip.len()
    }
}

impl Middleware for RateLimiter {
    fn handle(&self, connection: &ConnectionInfo, mut request: IncomingRequest) -> IncomingRequest {
        let ip = connection.peer_addr.ip();
        if !self.check(ip) {
            tracing::warn!(client = %ip, client_id = %connection.client_id, "Rate limit exceeded");
            metrics::record_rate_limited();
            request.reject(ErrorCode::TooManyRequests, "rate limit exceeded");
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            requests_per_second: rps,
            burst_size: burst,
        })
    }

    #[test]
    fn burst_then_refill() {
        let limiter = limiter(2, 3);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let start = Instant::now();

        assert!(limiter.check_at(ip, start));
        assert!(limiter.check_at(ip, start));
        assert!(limiter.check_at(ip, start));
        assert!(!limiter.check_at(ip, start));

        // 2 rps: one token back after half a second.
        let later = start + Duration::from_millis(500);
        assert!(limiter.check_at(ip, later));
        assert!(!limiter.check_at(ip, later));
    }

    #[test]
    fn addresses_are_independent() {
        let limiter = limiter(1, 1);
        let now = Instant::now();
        assert!(limiter.check_at("192.0.2.1".parse().unwrap(), now));
        assert!(limiter.check_at("192.0.2.2".parse().unwrap(), now));
        assert!(!limiter.check_at("192.0.2.1".parse().unwrap(), now));
        assert_eq!(limiter.tracked_addresses(), 2);
    }

    #[test]
    fn idle_buckets_are_evicted() {
        // Empty to full takes two seconds.
        let limiter = limiter(2, 4);
        let start = Instant::now();
        let busy: IpAddr = "192.0.2.1".parse().unwrap();
        for i in 0..100u8 {
            let ip = IpAddr::from([198, 51, 100, i]);
            assert!(limiter.check_at(ip, start));
        }
        while limiter.check_at(busy, start) {}
        assert_eq!(limiter.tracked_addresses(), 101);

        // Inside the window nothing is dropped.
        assert!(!limiter.check_at(busy, start + Duration::from_millis(100)));
        assert_eq!(limiter.tracked_addresses(), 101);

        // A window later only the address that just spoke remains.
        let later = start + Duration::from_millis(2500);
        assert!(limiter.check_at("192.0.2.7".parse().unwrap(), later));
        assert_eq!(limiter.tracked_addresses(), 1);

        // A forgotten bucket answers as a refilled one would have.
        assert!(limiter.check_at(busy, later));
    }

    #[test]
    fn disabled_allows_everything() {
        let limiter = RateLimiter::new(&RateLimitConfig::default());
        let ip: IpAddr = "192.0.2.9".parse().unwrap();
        assert!((0..1000).all(|_| limiter.check(ip)));
        assert_eq!(limiter.tracked_addresses(), 0);
    }
}
