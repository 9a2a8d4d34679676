//! HTTP module: shared state, router, and the HTTP/HTTPS listeners.

pub mod auth;
pub mod error;
mod health;
pub mod ratelimit;
mod settings_api;
pub mod tls_gate;

pub use error::ApiError;
pub use tls_gate::SecureTransport;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use http_body_util::{BodyExt, Limited};
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::settings::{ApiKeyStore, SettingsStore};
use crate::{fs, stack};

use auth::NonceStore;
use ratelimit::RateLimiter;

/// Shared application state. Each singleton owns its own lock; the state
/// itself is cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SettingsStore>,
    pub api_key: Arc<ApiKeyStore>,
    pub nonce_cache: Arc<NonceStore>,
    pub limiter: Arc<RateLimiter>,
    pub auth_fail_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(settings: Arc<SettingsStore>, api_key: Arc<ApiKeyStore>) -> Self {
        Self {
            settings,
            api_key,
            nonce_cache: Arc::new(NonceStore::new()),
            limiter: Arc::new(RateLimiter::new()),
            auth_fail_limiter: Arc::new(RateLimiter::new()),
        }
    }
}

/// Build the main router. Middleware order (outermost first): TLS gate,
/// auth, rate limit — the limiter keys by principal, so it runs after auth.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/settings", get(settings_api::get_settings).post(settings_api::update_settings))
        .route("/fs/read", get(fs::read_file))
        .route("/fs/write", post(fs::write_file))
        .route("/fs/list", get(fs::list_dir))
        .route("/fs/download", get(fs::download_file))
        .route("/fs/upload", post(fs::upload_file))
        .route("/fs/zip", post(fs::zip_archive))
        .route("/fs/unzip", post(fs::unzip_archive))
        .route("/fs/fetch", post(fs::fetch_remote_file))
        .route("/stack/up", post(stack::stack_up))
        .route("/stack/down", post(stack::stack_down))
        .route("/stack/restart", post(stack::stack_restart))
        .route("/stack/status", get(stack::stack_status))
        .route("/stack/logs/stream", get(stack::stack_logs_stream))
        .route("/stack/exec", get(stack::stack_exec))
        .layer(middleware::from_fn_with_state(state.clone(), ratelimit::rate_limit_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), tls_gate::tls_gate_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve plain HTTP.
pub async fn serve_http(state: AppState, addr: SocketAddr) -> Result<()> {
    let router = build_router(state);
    info!("HTTP server listening on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

/// Serve HTTPS with a manual accept loop so each connection can carry its
/// peer address and a secure-transport marker into the request extensions.
pub async fn serve_https(state: AppState, addr: SocketAddr, cert_path: &Path, key_path: &Path) -> Result<()> {
    use std::io::BufReader;

    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("failed to open cert file {}", cert_path.display()))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<_, _>>()
        .with_context(|| "failed to parse certificates")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("failed to open key file {}", key_path.display()))?;
    let mut key_reader = BufReader::new(key_file);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| "failed to read private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .with_context(|| "invalid TLS configuration")?;

    let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let router = build_router(state);

    info!("HTTPS server listening on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let acceptor = tls_acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    error!("TLS handshake failed from {}: {}", peer_addr, err);
                    return;
                }
            };

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let service = hyper::service::service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
                let router = router.clone();
                req.extensions_mut().insert(ConnectInfo(peer_addr));
                req.extensions_mut().insert(SecureTransport);
                async move { tower::ServiceExt::oneshot(router, req).await }
            });

            // Upgrades stay enabled so /stack/exec works over TLS.
            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                error!("error serving connection from {}: {}", peer_addr, err);
            }
        });
    }
}

/// Normalise `":8031"` / `"host:port"` into a socket address.
pub fn parse_listen_addr(http_port: &str) -> Result<SocketAddr> {
    let candidate = if http_port.starts_with(':') {
        format!("0.0.0.0{http_port}")
    } else {
        http_port.to_string()
    };
    candidate
        .parse()
        .with_context(|| format!("invalid listen address {http_port:?}"))
}

/// Collect a request body under a byte cap. Exceeding the cap maps to 413,
/// anything else to 400.
pub async fn read_body_limited(body: Body, cap: i64) -> Result<Bytes, ApiError> {
    let cap = usize::try_from(cap).unwrap_or(usize::MAX);
    match Limited::new(body, cap).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) => {
            if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                Err(ApiError::PayloadTooLarge("request too large".to_string()))
            } else {
                Err(ApiError::BadRequest("invalid request body".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(parse_listen_addr(":8031").unwrap(), "0.0.0.0:8031".parse::<SocketAddr>().unwrap());
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("not-an-addr").is_err());
    }

    #[tokio::test]
    async fn test_read_body_limited_enforces_cap() {
        let ok = read_body_limited(Body::from(vec![0u8; 16]), 16).await;
        assert_eq!(ok.unwrap().len(), 16);

        let err = read_body_limited(Body::from(vec![0u8; 17]), 16).await.unwrap_err();
        assert!(matches!(err, ApiError::PayloadTooLarge(_)));
    }
}
