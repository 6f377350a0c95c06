// Request rate limiting
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorRateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub struct RateLimiter {
    per_ip_limiter: DefaultKeyedRateLimiter<IpAddr>,
    global_limiter: DefaultDirectRateLimiter,
    last_cleanup: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second_per_ip: u32,
    pub global_requests_per_second: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second_per_ip: 100,
            global_requests_per_second: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    RateLimited(RateLimitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    PerIPLimit,
    GlobalLimit,
}

fn quota(per_second: u32) -> Quota {
    Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN))
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            per_ip_limiter: GovernorRateLimiter::keyed(quota(config.requests_per_second_per_ip)),
            global_limiter: GovernorRateLimiter::direct(quota(config.global_requests_per_second)),
            last_cleanup: AtomicU64::new(unix_secs()),
        }
    }

    /// Check if a request from this IP should be allowed
    pub fn check(&self, source_ip: IpAddr) -> RateLimitResult {
        self.cleanup_old_entries();

        // Check global rate limit first
        if self.global_limiter.check().is_err() {
            return RateLimitResult::RateLimited(RateLimitReason::GlobalLimit);
        }

        if self.per_ip_limiter.check_key(&source_ip).is_err() {
            return RateLimitResult::RateLimited(RateLimitReason::PerIPLimit);
        }

        RateLimitResult::Allowed
    }

    fn cleanup_old_entries(&self) {
        // Only cleanup every 60 seconds
        let now = unix_secs();
        let last = self.last_cleanup.load(Ordering::Relaxed);
        if now.saturating_sub(last) < 60 {
            return;
        }
        if self
            .last_cleanup
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        self.per_ip_limiter.retain_recent();
        self.per_ip_limiter.shrink_to_fit();
        debug!("Cleaned up rate limiter: {} IPs tracked", self.per_ip_limiter.len());
    }

    pub fn tracked_ips(&self) -> usize {
        self.per_ip_limiter.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_ip_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second_per_ip: 2,
            global_requests_per_second: 100,
        });
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.1".parse().unwrap();

        assert_eq!(limiter.check(ip), RateLimitResult::Allowed);
        assert_eq!(limiter.check(ip), RateLimitResult::Allowed);
        assert_eq!(
            limiter.check(ip),
            RateLimitResult::RateLimited(RateLimitReason::PerIPLimit)
        );
        assert_eq!(limiter.check(other), RateLimitResult::Allowed);
        assert_eq!(limiter.tracked_ips(), 2);
    }

    #[test]
    fn test_global_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second_per_ip: 100,
            global_requests_per_second: 1,
        });

        assert_eq!(limiter.check("127.0.0.1".parse().unwrap()), RateLimitResult::Allowed);
        assert_eq!(
            limiter.check("127.0.0.2".parse().unwrap()),
            RateLimitResult::RateLimited(RateLimitReason::GlobalLimit)
        );
    }
}
