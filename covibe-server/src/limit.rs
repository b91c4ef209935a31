//! Per-IP submission rate limiting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use parking_lot::Mutex;

/// Addresses tracked before the least recently seen is evicted.
const MAX_TRACKED_IPS: usize = 4096;

/// Token bucket refilled continuously at `rate_per_minute`, holding at most
/// `rate_per_minute` tokens.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(rate_per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(rate_per_minute);
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec: capacity / 60.0,
            last_update: now,
        }
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    rate_per_minute: u32,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl RateLimiter {
    /// A limit of 0 disables limiting.
    pub fn new(rate_per_minute: u32) -> Self {
        Self {
            rate_per_minute,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one submission slot for `ip`.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        if self.rate_per_minute == 0 {
            return true;
        }
        let mut buckets = self.buckets.lock();
        if !buckets.contains_key(&ip) && buckets.len() >= MAX_TRACKED_IPS {
            let oldest = buckets
                .iter()
                .min_by_key(|(_, b)| b.last_update)
                .map(|(ip, _)| *ip);
            if let Some(oldest) = oldest {
                buckets.remove(&oldest);
            }
        }
        buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(self.rate_per_minute, now))
            .try_consume(now)
    }
}
