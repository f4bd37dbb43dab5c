//! Per-client-IP rate limiting.
//!
//! One token bucket per source IP, stored in a concurrent map. A background
//! task evicts entries that have been idle for longer than the cleanup
//! interval, which bounds the map by the number of IPs seen within one
//! interval.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::{
    config::RateLimitConfig,
    core::{GatewayError, TokenBucket},
    observability::metrics::GatewayMetrics,
};

struct ClientEntry {
    bucket: TokenBucket,
    last_seen: Mutex<Instant>,
}

/// Per-IP admission gate.
pub struct IpRateLimiter {
    clients: DashMap<String, Arc<ClientEntry>>,
    limit: f64,
    burst: f64,
    cleanup_interval: Duration,
}

impl IpRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            clients: DashMap::new(),
            limit: config.limit,
            burst: config.burst_limit as f64,
            cleanup_interval: config.cleanup_interval(),
        }
    }

    /// Try to admit one request from `ip`.
    pub fn check(&self, ip: &str) -> bool {
        let entry = self
            .clients
            .entry(ip.to_string())
            .or_insert_with(|| {
                Arc::new(ClientEntry {
                    bucket: TokenBucket::new(self.burst, self.limit),
                    last_seen: Mutex::new(Instant::now()),
                })
            })
            .clone();

        *entry.last_seen.lock() = Instant::now();
        entry.bucket.try_acquire(1.0)
    }

    /// Spawn the GC task; it exits on the shared stop signal.
    pub fn start_cleanup(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.cleanup_interval);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("rate limiter cleanup stopped");
                        return;
                    }
                    _ = ticker.tick() => limiter.cleanup(),
                }
            }
        });
    }

    fn cleanup(&self) {
        self.clients.retain(|ip, entry| {
            let keep = entry.last_seen.lock().elapsed() <= self.cleanup_interval;
            if !keep {
                debug!(ip = %ip, "evicted idle rate limit entry");
            }
            keep
        });
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// Extract the client IP: first `X-Forwarded-For` entry, then `X-Real-IP`,
/// then `CF-Connecting-IP`, then the socket peer address.
pub fn extract_client_ip(headers: &HeaderMap, remote: Option<&SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return Some(real_ip.to_string());
        }
    }
    if let Some(cf_ip) = headers.get("cf-connecting-ip").and_then(|v| v.to_str().ok()) {
        if !cf_ip.is_empty() {
            return Some(cf_ip.to_string());
        }
    }
    remote.map(|addr| addr.ip().to_string())
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<IpRateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let Some(ip) = extract_client_ip(req.headers(), remote.as_ref()) else {
        error!("could not determine client address for rate limiting");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
    };

    if !limiter.check(&ip) {
        warn!(
            ip = %ip,
            method = %req.method(),
            path = req.uri().path(),
            "request rate limited"
        );
        GatewayMetrics::record_rate_limited();
        return GatewayError::RateLimited.into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn limiter(limit: f64, burst: u32, cleanup_secs: u64) -> IpRateLimiter {
        IpRateLimiter::new(&RateLimitConfig {
            limit,
            burst_limit: burst,
            cleanup_interval_secs: cleanup_secs,
        })
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = limiter(1.0, 2, 60);

        assert!(limiter.check("10.0.0.1"));
        assert!(limiter.check("10.0.0.1"));
        assert!(!limiter.check("10.0.0.1"));

        // Other clients have their own bucket.
        assert!(limiter.check("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_refill_allows_again() {
        let limiter = limiter(10.0, 1, 60);

        assert!(limiter.check("10.0.0.1"));
        assert!(!limiter.check("10.0.0.1"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.check("10.0.0.1"));
    }

    #[test]
    fn test_cleanup_evicts_idle_entries() {
        let limiter = limiter(1.0, 2, 0);

        limiter.check("10.0.0.1");
        assert_eq!(limiter.client_count(), 1);

        std::thread::sleep(Duration::from_millis(20));
        limiter.cleanup();
        assert_eq!(limiter.client_count(), 0);
    }

    #[test]
    fn test_client_ip_preference_order() {
        let remote: SocketAddr = "192.0.2.9:4242".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.8"));
        headers.insert("cf-connecting-ip", HeaderValue::from_static("203.0.113.9"));
        assert_eq!(
            extract_client_ip(&headers, Some(&remote)).as_deref(),
            Some("203.0.113.7")
        );

        headers.remove("x-forwarded-for");
        assert_eq!(
            extract_client_ip(&headers, Some(&remote)).as_deref(),
            Some("203.0.113.8")
        );

        headers.remove("x-real-ip");
        assert_eq!(
            extract_client_ip(&headers, Some(&remote)).as_deref(),
            Some("203.0.113.9")
        );

        headers.remove("cf-connecting-ip");
        assert_eq!(
            extract_client_ip(&headers, Some(&remote)).as_deref(),
            Some("192.0.2.9")
        );

        assert!(extract_client_ip(&HeaderMap::new(), None).is_none());
    }
}
