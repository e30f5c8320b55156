//! Per-IP connection rate limiting.

use std::net::IpAddr;
use std::num::NonZeroU32;

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

pub type SimpleRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Max new connections per IP per second (0 = disabled).
    pub conn_per_ip_per_sec: u32,
    /// Burst allowance as a multiple of the per-second rate.
    pub burst_multiplier: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            conn_per_ip_per_sec: 20,
            burst_multiplier: 3,
        }
    }
}

impl RateLimitConfig {
    pub fn conn_limit_enabled(&self) -> bool {
        self.conn_per_ip_per_sec > 0
    }

    fn quota(&self) -> Option<Quota> {
        let rate = NonZeroU32::new(self.conn_per_ip_per_sec)?;
        let burst = NonZeroU32::new(self.conn_per_ip_per_sec.saturating_mul(self.burst_multiplier))
            .unwrap_or(rate);
        Some(Quota::per_second(rate).allow_burst(burst))
    }
}

/// Tracks connection attempts per source address.
pub struct IpRateLimiter {
    limiters: DashMap<IpAddr, SimpleRateLimiter>,
    quota: Option<Quota>,
}

impl IpRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limiters: DashMap::new(),
            quota: config.quota(),
        }
    }

    /// `true` if a connection from `ip` is allowed now.
    pub fn check(&self, ip: IpAddr) -> bool {
        let Some(quota) = self.quota else {
            return true;
        };
        self.limiters
            .entry(ip)
            .or_insert_with(|| RateLimiter::direct(quota))
            .check()
            .is_ok()
    }

    /// Evict arbitrary entries once more than `max_entries` IPs are tracked.
    pub fn cleanup_stale(&self, max_entries: usize) {
        if self.limiters.len() <= max_entries {
            return;
        }
        let to_remove = self.limiters.len() - max_entries;
        let keys: Vec<IpAddr> = self
            .limiters
            .iter()
            .take(to_remove)
            .map(|e| *e.key())
            .collect();
        for key in keys {
            self.limiters.remove(&key);
        }
    }

    pub fn tracked(&self) -> usize {
        self.limiters.len()
    }
}
