//! Per-client-IP token bucket rate limiting.

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::Request;
use axum::{middleware, response::Response};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::ApiError;
use crate::expiring::ConcurrentExpiringMap;
use crate::http::request_client_ip;

/// Token bucket refilled continuously at `rate` tokens per second up to `burst`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket that starts full.
    pub fn full(rate: f64, burst: u32, now: Instant) -> Self {
        Self {
            rate,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Takes one token, or returns how long until one is available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let wait = (1.0 - self.tokens) / self.rate;
        Err(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX))
    }

    #[cfg(test)]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Visitor registry: one bucket per client IP, forgotten after `ttl` of silence.
pub struct RateLimiter {
    visitors: ConcurrentExpiringMap<IpAddr, TokenBucket>,
    config: RateLimitConfig,
    trust_proxy: bool,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, trust_proxy: bool) -> Self {
        Self {
            visitors: ConcurrentExpiringMap::new(config.ttl, config.sweep_interval),
            config,
            trust_proxy,
        }
    }

    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), Duration> {
        let RateLimitConfig { rate, burst, .. } = self.config;
        self.visitors.with_entry_at(
            ip,
            now,
            || TokenBucket::full(rate, burst, now),
            |bucket| bucket.try_acquire(now),
        )
    }

    #[cfg(test)]
    pub fn is_tracked_at(&self, ip: IpAddr, now: Instant) -> bool {
        self.visitors.contains_at(&ip, now)
    }

    /// Drops visitors idle for longer than the TTL.
    pub fn sweep(&self) -> usize {
        self.visitors.sweep_at(Instant::now())
    }

    pub fn sweep_interval(&self) -> Duration {
        self.visitors.sweep_interval()
    }

    pub fn visitor_ttl(&self) -> Duration {
        self.visitors.ttl()
    }

    pub fn visitor_count(&self) -> usize {
        self.visitors.len()
    }

    fn client_ip(&self, req: &Request<AxumBody>) -> Option<IpAddr> {
        request_client_ip(req, self.trust_proxy)
    }
}

/// Rejects requests from clients that ran out of tokens.
pub async fn rate_limit_middleware(
    Extension(limiter): Extension<Arc<RateLimiter>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let Some(ip) = limiter.client_ip(&req) else {
        warn!(path = req.uri().path(), "client address unavailable");
        return Err(ApiError::MissingClientAddr);
    };

    if let Err(wait) = limiter.check(ip) {
        let retry_after = wait.as_secs_f64().ceil().max(1.0) as u64;
        debug!(client_ip = %ip, retry_after, "rate limited");
        return Err(ApiError::TooManyRequests(retry_after));
    }

    Ok(next.run(req).await)
}
