/*!
 * In-memory, per-client rate limiting for the public recovery endpoints.
 *
 * The callback and recovery endpoints are reachable without authentication,
 * so they are throttled per client IP with a fixed window. State lives in a
 * [`DashMap`]; each API instance enforces its own window.
 */
use axum::{
    extract::{Request, State},
    http::{Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::errors::ErrorResponse;

/// Numeric strings are always valid header values; fall back to "0" for the
/// impossible case rather than panicking.
fn num_to_header_value<T: ToString>(n: T) -> http::HeaderValue {
    http::HeaderValue::from_str(&n.to_string())
        .unwrap_or_else(|_| http::HeaderValue::from_static("0"))
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

impl RateLimitEntry {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    fn tick(&mut self, window: Duration) -> u32 {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= window {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count
    }

    fn time_until_reset(&self, window: Duration) -> Duration {
        window.saturating_sub(self.window_start.elapsed())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_duration: Duration,
    pub enable_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window_duration: Duration::from_secs(60),
            enable_headers: true,
        }
    }
}

#[derive(Debug)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: Duration,
}

pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn check_rate_limit(&self, key: &str) -> RateLimitResult {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(RateLimitEntry::new);

        let count = entry.tick(self.config.window_duration);
        let reset_time = entry.time_until_reset(self.config.window_duration);
        RateLimitResult {
            allowed: count <= self.config.requests_per_window,
            limit: self.config.requests_per_window,
            remaining: self.config.requests_per_window.saturating_sub(count),
            reset_time,
        }
    }

    /// Drop entries whose window has long expired, so the map does not grow
    /// with one record per client forever.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| {
            now.duration_since(entry.window_start) < self.config.window_duration * 2
        });
    }
}

/// Key by real client IP, honoring the usual proxy headers.
fn extract_ip_key(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(ip) = forwarded_str.split(',').next() {
                return format!("ip:{}", ip.trim());
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return format!("ip:{}", ip_str);
        }
    }

    "ip:unknown".to_string()
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response<axum::body::Body>, Response<axum::body::Body>> {
    let path = request.uri().path().to_string();
    if path.starts_with("/health") || path.starts_with("/docs") || path.starts_with("/api-docs") {
        return Ok(next.run(request).await);
    }

    let key = extract_ip_key(&request);
    let result = limiter.check_rate_limit(&key);

    if !result.allowed {
        warn!(key = %key, path = %path, "rate limit exceeded");
        let body = ErrorResponse {
            error: "rate_limit_exceeded".to_string(),
            message: "Too many requests, retry later".to_string(),
            details: None,
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut response =
            (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
        if limiter.config.enable_headers {
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", num_to_header_value(result.limit));
            headers.insert("X-RateLimit-Remaining", num_to_header_value(0));
            headers.insert(
                "X-RateLimit-Reset",
                num_to_header_value(result.reset_time.as_secs()),
            );
        }
        return Err(response);
    }

    let mut response = next.run(request).await;
    if limiter.config.enable_headers {
        let headers = response.headers_mut();
        headers.insert("X-RateLimit-Limit", num_to_header_value(result.limit));
        headers.insert("X-RateLimit-Remaining", num_to_header_value(result.remaining));
        headers.insert(
            "X-RateLimit-Reset",
            num_to_header_value(result.reset_time.as_secs()),
        );
    }
    Ok(response)
}

/// Periodically evicts idle windows.
pub async fn start_cleanup_task(limiter: Arc<RateLimiter>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        limiter.cleanup_expired();
    }
}
