//! Per-IP rate limiting for the admin surface.
//!
//! Token bucket keyed by connection IP. The /health endpoint is exempt so
//! orchestration probes never starve.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    body::Body,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState, Quota, RateLimiter,
};

use crate::config::RateLimitConfig;
use crate::error::ApiError;

pub type KeyedRateLimiter =
    RateLimiter<IpAddr, dashmap::DashMap<IpAddr, InMemoryState>, DefaultClock, NoOpMiddleware>;

/// `value` when positive, else `fallback`, never zero.
fn positive(value: u32, fallback: u32) -> NonZeroU32 {
    NonZeroU32::new(value)
        .or_else(|| NonZeroU32::new(fallback))
        .unwrap_or(NonZeroU32::MIN)
}

#[derive(Clone)]
pub struct RateLimitState {
    limiter: Option<Arc<KeyedRateLimiter>>,
}

impl RateLimitState {
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { limiter: None };
        }

        // A zero in the config would make the quota unconstructible.
        let rps = positive(config.requests_per_second, 100);
        let burst = positive(config.burst_size, 50);
        let quota = Quota::per_second(rps).allow_burst(burst);

        Self {
            limiter: Some(Arc::new(RateLimiter::keyed(quota))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    pub fn check(&self, ip: IpAddr) -> bool {
        match self.limiter {
            Some(ref limiter) => limiter.check_key(&ip).is_ok(),
            None => true,
        }
    }
}

/// Returns the `rate_limited` envelope with a 429 when the client exceeds
/// its bucket.
pub async fn rate_limit_middleware(
    axum::extract::State(state): axum::extract::State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !state.is_enabled() || req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let ip = req
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    if state.check(ip) {
        next.run(req).await
    } else {
        tracing::debug!(client_ip = %ip, "rate limit exceeded");
        ApiError::RateLimited.into_response()
    }
}
