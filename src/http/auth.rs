//! HMAC request authentication and the nonce replay cache.
//!
//! Check order is deliberate: key, timestamp window, signature, then the
//! replay cache. The cache is only touched after the signature verifies, so
//! unauthenticated callers cannot exhaust it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::limits::{MAX_NONCE_ENTRIES, MAX_NONCE_LENGTH};
use crate::settings::Settings;

use super::error::ApiError;
use super::ratelimit::client_addr;
use super::AppState;

pub const HEADER_API_KEY: &str = "x-api-key";
pub const HEADER_TIMESTAMP: &str = "x-request-timestamp";
pub const HEADER_NONCE: &str = "x-request-nonce";
pub const HEADER_SIGNATURE: &str = "x-request-signature";

type HmacSha256 = Hmac<Sha256>;

/// The authenticated shared secret, attached to the request extensions so
/// the rate limiter downstream can key by identity instead of address.
#[derive(Clone)]
pub struct AuthPrincipal(pub String);

pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let cfg = state.settings.get();

    if req.uri().path() == "/health" && !cfg.health_requires_auth {
        return next.run(req).await;
    }

    let configured_key = state.api_key.get();
    if configured_key.is_empty() {
        // Legacy unauthenticated mode.
        return next.run(req).await;
    }

    let api_key = req
        .headers()
        .get(HEADER_API_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !secure_equal(api_key, &configured_key) {
        return reject_unauthorized(&state, &req, &cfg);
    }

    let timestamp = header_value(&req, HEADER_TIMESTAMP);
    let nonce = header_value(&req, HEADER_NONCE);
    let signature = header_value(&req, HEADER_SIGNATURE);
    if timestamp.is_empty() || nonce.is_empty() || signature.is_empty() {
        return reject_unauthorized(&state, &req, &cfg);
    }
    if nonce.len() > MAX_NONCE_LENGTH {
        return reject_unauthorized(&state, &req, &cfg);
    }

    let ts: i64 = match timestamp.parse() {
        Ok(ts) => ts,
        Err(_) => return reject_unauthorized(&state, &req, &cfg),
    };

    let skew = cfg.replay_window_seconds();
    let now = unix_now();
    if (now - ts).abs() > skew {
        return reject_unauthorized(&state, &req, &cfg);
    }

    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let expected = build_signature(&configured_key, &timestamp, &nonce, req.method().as_str(), &uri);
    if !secure_equal(&signature, &expected) {
        return reject_unauthorized(&state, &req, &cfg);
    }

    if !state.nonce_cache.use_nonce(&nonce, Duration::from_secs(skew as u64)) {
        return reject_unauthorized(&state, &req, &cfg);
    }

    req.extensions_mut().insert(AuthPrincipal(configured_key));
    next.run(req).await
}

/// hex(HMAC-SHA256(secret, ts "\n" nonce "\n" method "\n" request-URI))
pub fn build_signature(secret: &str, timestamp: &str, nonce: &str, method: &str, uri: &str) -> String {
    let payload = [timestamp, nonce, method, uri].join("\n");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string equality; length mismatch short-circuits, which
/// leaks only the length.
pub fn secure_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn reject_unauthorized(state: &AppState, req: &Request, cfg: &Settings) -> Response {
    let addr = client_addr(req.headers(), req.extensions(), cfg);
    if !state
        .auth_fail_limiter
        .allow(&addr, cfg.rate_limit_rps, cfg.rate_limit_burst)
    {
        warn!(from = %addr, path = %req.uri().path(), "auth failure rate limited");
        return ApiError::RateLimited.into_response();
    }
    warn!(from = %addr, path = %req.uri().path(), "unauthorized request");
    ApiError::Unauthorized.into_response()
}

fn header_value(req: &Request, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Single-use nonce set with TTL and bounded memory.
pub struct NonceStore {
    inner: Mutex<NonceInner>,
}

struct NonceInner {
    entries: HashMap<String, Instant>,
    last_cleanup: Instant,
}

impl NonceStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(NonceInner {
                entries: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Record `nonce` as used for `ttl`. Returns false when it is already
    /// live, true otherwise.
    pub fn use_nonce(&self, nonce: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("nonce lock poisoned");

        if let Some(expires) = inner.entries.get(nonce) {
            if *expires > now {
                return false;
            }
        }

        inner.entries.insert(nonce.to_string(), now + ttl);
        inner.cleanup_if_needed(now);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

impl Default for NonceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceInner {
    fn cleanup_if_needed(&mut self, now: Instant) {
        if now.duration_since(self.last_cleanup) < crate::limits::CLEANUP_INTERVAL {
            return;
        }
        self.entries.retain(|_, expires| *expires > now);
        self.last_cleanup = now;

        // Fail closed: wholesale eviction bounds memory; honest clients
        // retry with a fresh nonce.
        if self.entries.len() > MAX_NONCE_ENTRIES {
            self.entries.clear();
        }
    }
}
