//! vestri-worker library
//!
//! Core exports for the node-local worker daemon: the authenticated HTTP
//! control surface, the path sandbox, and the stack/console plumbing.

use clap::Parser;

pub mod fs;
pub mod http;
pub mod limits;
pub mod settings;
pub mod stack;

/// Worker semantic version constant
pub const VESTRI_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI arguments for the worker daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "vestri-worker")]
#[command(about = "Node-local worker daemon for compose stacks and sandboxed files")]
#[command(version = VESTRI_VERSION)]
pub struct Args {
    /// Path to the persisted settings file
    #[arg(long, env = "VESTRI_SETTINGS_PATH", default_value = "/etc/vestri/settings.json")]
    pub settings_path: String,

    /// Path to the persisted API key file
    #[arg(long, env = "VESTRI_KEY_PATH", default_value = "/etc/vestri/api.key")]
    pub key_path: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, env = "VESTRI_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "VESTRI_LOG_JSON")]
    pub log_json: bool,

    /// Enable verbose logging
    #[arg(short, long, env = "VESTRI_VERBOSE")]
    pub verbose: bool,
}

pub use http::AppState;
pub use settings::{ApiKeyStore, Settings, SettingsStore};
