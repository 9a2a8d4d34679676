//! Per-key token-bucket rate limiting.
//!
//! Keys are `key:<sha256hex>` for authenticated requests and `ip:<addr>`
//! otherwise. Buckets refill lazily on access; idle clients are swept at
//! most once per minute.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Extensions, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::limits::{CLEANUP_INTERVAL, RATE_CLIENT_TTL};
use crate::settings::Settings;

use super::auth::AuthPrincipal;
use super::error::ApiError;
use super::AppState;

pub struct RateLimiter {
    inner: Mutex<LimiterInner>,
}

struct LimiterInner {
    clients: HashMap<String, RateClient>,
    last_cleanup: Instant,
}

struct RateClient {
    tokens: f64,
    last: Instant,
    last_seen: Instant,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LimiterInner {
                clients: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Take one token from `key`'s bucket. A non-positive rate or burst
    /// disables limiting entirely.
    pub fn allow(&self, key: &str, rate: f64, burst: i64) -> bool {
        if rate <= 0.0 || burst <= 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock().expect("limiter lock poisoned");
        let burst = burst as f64;

        let client = inner.clients.entry(key.to_string()).or_insert(RateClient {
            tokens: burst,
            last: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(client.last).as_secs_f64();
        client.tokens = (client.tokens + elapsed * rate).min(burst);
        client.last = now;
        client.last_seen = now;

        let allowed = if client.tokens < 1.0 {
            false
        } else {
            client.tokens -= 1.0;
            true
        };

        inner.cleanup_if_needed(now);
        allowed
    }

    #[cfg(test)]
    fn client_count(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl LimiterInner {
    fn cleanup_if_needed(&mut self, now: Instant) {
        if now.duration_since(self.last_cleanup) < CLEANUP_INTERVAL {
            return;
        }
        self.clients
            .retain(|_, client| now.duration_since(client.last_seen) < RATE_CLIENT_TTL);
        self.last_cleanup = now;
    }
}

pub async fn rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let cfg = state.settings.get();
    let key = rate_limit_key(req.headers(), req.extensions(), &cfg);
    if !state.limiter.allow(&key, cfg.rate_limit_rps, cfg.rate_limit_burst) {
        warn!(key = %key, path = %req.uri().path(), "rate limit exceeded");
        return ApiError::RateLimited.into_response();
    }
    next.run(req).await
}

/// Rate-limit identity: the hashed shared secret when the request is
/// authenticated, otherwise the client address.
pub fn rate_limit_key(headers: &HeaderMap, extensions: &Extensions, cfg: &Settings) -> String {
    if let Some(AuthPrincipal(secret)) = extensions.get::<AuthPrincipal>() {
        if !secret.is_empty() {
            let digest = Sha256::digest(secret.as_bytes());
            return format!("key:{}", hex::encode(digest));
        }
    }
    format!("ip:{}", client_addr(headers, extensions, cfg))
}

/// Best-effort client address: proxy headers when trusted, else the peer
/// address recorded at accept time.
pub fn client_addr(headers: &HeaderMap, extensions: &Extensions, cfg: &Settings) -> String {
    if cfg.trust_proxy_headers {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(hop) = first_forwarded_hop(forwarded) {
                return hop;
            }
        }
        if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            let real_ip = real_ip.trim();
            if !real_ip.is_empty() {
                return real_ip.to_string();
            }
        }
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn first_forwarded_hop(value: &str) -> Option<String> {
    value
        .split(',')
        .map(str::trim)
        .find(|hop| !hop.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_disabled_when_rate_nonpositive() {
        let limiter = RateLimiter::new();
        for _ in 0..1000 {
            assert!(limiter.allow("k", 0.0, 10));
            assert!(limiter.allow("k", -1.0, 10));
            assert!(limiter.allow("k", 1.0, 0));
        }
        assert_eq!(limiter.client_count(), 0);
    }

    #[test]
    fn test_burst_then_deny() {
        let limiter = RateLimiter::new();
        // rps low enough that no meaningful refill happens mid-test
        assert!(limiter.allow("k", 0.001, 2));
        assert!(limiter.allow("k", 0.001, 2));
        assert!(!limiter.allow("k", 0.001, 2));
        assert!(!limiter.allow("k", 0.001, 2));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("a", 0.001, 1));
        assert!(!limiter.allow("a", 0.001, 1));
        assert!(limiter.allow("b", 0.001, 1));
    }

    #[test]
    fn test_refill_clamped_to_burst() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("k", 1000.0, 3));
        std::thread::sleep(std::time::Duration::from_millis(20));
        // Refill over 20ms at 1000 rps far exceeds the burst; the bucket
        // must still hold at most 3 tokens.
        for _ in 0..3 {
            assert!(limiter.allow("k", 0.001, 3));
        }
        assert!(!limiter.allow("k", 0.001, 3));
    }

    #[test]
    fn test_idle_clients_swept() {
        let limiter = RateLimiter::new();
        assert!(limiter.allow("old", 1.0, 5));
        let now = Instant::now();
        let (Some(idle), Some(due)) = (
            now.checked_sub(RATE_CLIENT_TTL + CLEANUP_INTERVAL),
            now.checked_sub(CLEANUP_INTERVAL * 2),
        ) else {
            return;
        };
        {
            let mut inner = limiter.inner.lock().unwrap();
            let client = inner.clients.get_mut("old").unwrap();
            client.last_seen = idle;
            inner.last_cleanup = due;
        }
        assert!(limiter.allow("fresh", 1.0, 5));
        assert_eq!(limiter.client_count(), 1);
    }

    #[test]
    fn test_client_addr_prefers_trusted_proxy_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", " 10.1.2.3 , 192.168.0.1".parse().unwrap());
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            4444,
        )));

        let trusted = Settings {
            trust_proxy_headers: true,
            ..Settings::default()
        };
        assert_eq!(client_addr(&headers, &extensions, &trusted), "10.1.2.3");

        let untrusted = Settings::default();
        assert_eq!(client_addr(&headers, &extensions, &untrusted), "127.0.0.1");
    }

    #[test]
    fn test_rate_limit_key_uses_principal() {
        let headers = HeaderMap::new();
        let mut extensions = Extensions::new();
        extensions.insert(AuthPrincipal("secret".to_string()));
        let key = rate_limit_key(&headers, &extensions, &Settings::default());
        assert!(key.starts_with("key:"));
        assert_eq!(key.len(), "key:".len() + 64);
    }
}
