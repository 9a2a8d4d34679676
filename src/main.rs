//! vestri-worker entry point.
//!
//! Boot order: parse args, load settings, bootstrap the API key, initialise
//! logging, then serve HTTP or HTTPS. The process exits non-zero only on
//! startup failure; request errors map to HTTP status codes.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use vestri_worker::http::{self, parse_listen_addr};
use vestri_worker::{ApiKeyStore, AppState, Args, SettingsStore, VESTRI_VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings_store = Arc::new(SettingsStore::load(&args.settings_path)?);
    let cfg = settings_store.get();

    let level = args
        .log_level
        .clone()
        .or_else(|| if args.verbose { Some("debug".to_string()) } else { None })
        .or_else(|| {
            if cfg.log_level.is_empty() {
                None
            } else {
                Some(cfg.log_level.clone())
            }
        })
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level, args.log_json);

    info!("starting vestri-worker v{}", VESTRI_VERSION);
    if !cfg.worker_name.is_empty() {
        info!(worker = %cfg.worker_name, "worker identity");
    }

    let api_key_store = Arc::new(ApiKeyStore::new(&args.key_path));
    let (key, generated) = api_key_store.ensure()?;
    if generated {
        info!("generated API key: {key}");
    }

    if !key.is_empty() && !cfg.use_tls && !cfg.trust_proxy_headers && !cfg.require_tls {
        warn!("API key is sent over plaintext HTTP without TLS");
    }
    if cfg.require_tls && !cfg.use_tls && !cfg.trust_proxy_headers {
        warn!("require_tls is enabled but TLS/proxy headers are disabled; requests will be rejected");
    }

    let state = AppState::new(settings_store, api_key_store);
    let addr = parse_listen_addr(&cfg.http_port)?;

    if cfg.use_tls {
        info!("starting HTTP server with TLS enabled");
        http::serve_https(state, addr, Path::new(&cfg.tls_cert), Path::new(&cfg.tls_key)).await
    } else {
        info!("starting HTTP server without TLS");
        http::serve_http(state, addr).await
    }
}

fn init_logging(level: &str, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
