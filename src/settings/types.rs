//! Persisted worker settings.
//!
//! Field names match the on-disk JSON exactly; unknown keys in the file are
//! ignored and missing keys keep their defaults, so older settings files
//! stay loadable.

use serde::{Deserialize, Serialize};

use crate::limits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listen address, `":8031"` or `"host:port"`
    pub http_port: String,

    /// Operator-visible worker label
    pub worker_name: String,

    /// Default tracing filter when no CLI/env override is given
    pub log_level: String,

    /// Enable native TLS on the listener
    #[serde(rename = "useTLS")]
    pub use_tls: bool,

    /// PEM certificate chain path
    #[serde(rename = "TLSCert")]
    pub tls_cert: String,

    /// PEM private key path
    #[serde(rename = "TLSKey")]
    pub tls_key: String,

    /// Reject requests that did not arrive over a secure context
    pub require_tls: bool,

    /// Honour X-Forwarded-Proto/Ssl/For and X-Real-IP
    pub trust_proxy_headers: bool,

    /// Sandbox root for every user-supplied path
    pub fs_base_path: String,

    /// Timestamp skew tolerance in seconds; also the nonce TTL
    pub replay_window_seconds: i64,

    /// Token refill rate per second; <= 0 disables rate limiting
    pub rate_limit_rps: f64,

    /// Token bucket capacity; <= 0 disables rate limiting
    pub rate_limit_burst: i64,

    pub max_archive_request_bytes: i64,
    pub max_inline_write_bytes: i64,
    pub max_upload_bytes: i64,
    pub max_unzip_bytes: i64,
    pub max_zip_entries: i64,

    /// When false, GET /health skips authentication
    pub health_requires_auth: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_port: ":8031".to_string(),
            worker_name: String::new(),
            log_level: String::new(),
            use_tls: false,
            tls_cert: String::new(),
            tls_key: String::new(),
            require_tls: false,
            trust_proxy_headers: false,
            fs_base_path: "/tmp/vestri".to_string(),
            replay_window_seconds: 0,
            rate_limit_rps: 0.0,
            rate_limit_burst: 0,
            max_archive_request_bytes: 0,
            max_inline_write_bytes: 0,
            max_upload_bytes: 0,
            max_unzip_bytes: 0,
            max_zip_entries: 0,
            health_requires_auth: false,
        }
    }
}

impl Settings {
    /// Effective JSON body cap for /fs/zip, /fs/unzip and /fs/fetch
    pub fn max_archive_request_bytes(&self) -> i64 {
        positive_or(self.max_archive_request_bytes, limits::DEFAULT_MAX_ARCHIVE_REQUEST_BYTES)
    }

    /// Effective JSON body cap for /fs/write
    pub fn max_inline_write_bytes(&self) -> i64 {
        positive_or(self.max_inline_write_bytes, limits::DEFAULT_MAX_INLINE_WRITE_BYTES)
    }

    /// Effective multipart cap for /fs/upload and ceiling for /fs/fetch
    pub fn max_upload_bytes(&self) -> i64 {
        positive_or(self.max_upload_bytes, limits::DEFAULT_MAX_UPLOAD_BYTES)
    }

    /// Effective total uncompressed byte cap per /fs/unzip
    pub fn max_unzip_bytes(&self) -> i64 {
        positive_or(self.max_unzip_bytes, limits::DEFAULT_MAX_UNZIP_BYTES)
    }

    /// Effective entry count cap per /fs/unzip
    pub fn max_zip_entries(&self) -> usize {
        if self.max_zip_entries > 0 {
            self.max_zip_entries as usize
        } else {
            limits::DEFAULT_MAX_ZIP_ENTRIES
        }
    }

    /// Effective replay window, seconds
    pub fn replay_window_seconds(&self) -> i64 {
        positive_or(self.replay_window_seconds, limits::DEFAULT_REPLAY_WINDOW_SECS)
    }
}

fn positive_or(value: i64, fallback: i64) -> i64 {
    if value > 0 {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.http_port, ":8031");
        assert_eq!(s.fs_base_path, "/tmp/vestri");
        assert!(!s.require_tls);
    }

    #[test]
    fn test_effective_caps_fall_back() {
        let s = Settings::default();
        assert_eq!(s.max_archive_request_bytes(), 1 << 20);
        assert_eq!(s.max_inline_write_bytes(), 10 << 20);
        assert_eq!(s.max_upload_bytes(), 1 << 30);
        assert_eq!(s.max_unzip_bytes(), 10 << 30);
        assert_eq!(s.max_zip_entries(), 100_000);
        assert_eq!(s.replay_window_seconds(), 300);
    }

    #[test]
    fn test_effective_caps_respect_overrides() {
        let s = Settings {
            max_inline_write_bytes: 1234,
            replay_window_seconds: 60,
            max_zip_entries: 5,
            ..Settings::default()
        };
        assert_eq!(s.max_inline_write_bytes(), 1234);
        assert_eq!(s.replay_window_seconds(), 60);
        assert_eq!(s.max_zip_entries(), 5);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let s: Settings = serde_json::from_str(r#"{"http_port": ":9000"}"#).unwrap();
        assert_eq!(s.http_port, ":9000");
        assert_eq!(s.fs_base_path, "/tmp/vestri");
    }
}
