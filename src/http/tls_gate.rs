//! Secure-context enforcement.
//!
//! A request is secure when it arrived over native TLS or, if proxy headers
//! are trusted, when the forwarding proxy says so. Secure responses carry
//! HSTS; insecure requests are rejected with 426 when `require_tls` is set.

use axum::extract::{Request, State};
use axum::http::header::{HeaderValue, STRICT_TRANSPORT_SECURITY};
use axum::http::{Extensions, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::error::ApiError;
use super::AppState;

const HSTS_HEADER_VALUE: &str = "max-age=31536000";

/// Marker inserted into request extensions by the TLS accept loop.
#[derive(Clone, Copy)]
pub struct SecureTransport;

pub async fn tls_gate_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let cfg = state.settings.get();
    let secure = is_secure_request(req.headers(), req.extensions(), cfg.trust_proxy_headers);

    if !secure && cfg.require_tls {
        return ApiError::TlsRequired.into_response();
    }

    let mut resp = next.run(req).await;
    if secure {
        resp.headers_mut()
            .insert(STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS_HEADER_VALUE));
    }
    resp
}

pub fn is_secure_request(headers: &HeaderMap, extensions: &Extensions, trust_proxy: bool) -> bool {
    if extensions.get::<SecureTransport>().is_some() {
        return true;
    }
    if !trust_proxy {
        return false;
    }

    if let Some(proto) = headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()) {
        let first = proto.split(',').next().unwrap_or("").trim();
        if first.eq_ignore_ascii_case("https") {
            return true;
        }
    }

    if let Some(ssl) = headers.get("x-forwarded-ssl").and_then(|v| v.to_str().ok()) {
        if ssl.trim().eq_ignore_ascii_case("on") {
            return true;
        }
    }

    false
}
