//! Named bounds for the worker daemon.
//!
//! Every cap the request pipeline enforces is defined here as a constant so
//! the bounds are auditable in one place. Settings may raise or lower the
//! byte caps; a zero or negative value falls back to these defaults.

use std::time::Duration;

/// JSON body cap for /fs/zip, /fs/unzip and /fs/fetch (1 MiB)
pub const DEFAULT_MAX_ARCHIVE_REQUEST_BYTES: i64 = 1 << 20;

/// JSON body cap for /fs/write (10 MiB)
pub const DEFAULT_MAX_INLINE_WRITE_BYTES: i64 = 10 << 20;

/// Multipart body cap for /fs/upload, also the /fs/fetch ceiling (1 GiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: i64 = 1 << 30;

/// Total uncompressed bytes allowed per /fs/unzip (10 GiB)
pub const DEFAULT_MAX_UNZIP_BYTES: i64 = 10 << 30;

/// Entry count allowed per /fs/unzip
pub const DEFAULT_MAX_ZIP_ENTRIES: usize = 100_000;

/// Timestamp skew tolerance and nonce TTL when unset in settings
pub const DEFAULT_REPLAY_WINDOW_SECS: i64 = 300;

/// Longest accepted X-Request-Nonce value
pub const MAX_NONCE_LENGTH: usize = 128;

/// Nonce cache hard cap; exceeding it evicts the whole set
pub const MAX_NONCE_ENTRIES: usize = 200_000;

/// Rate-limit clients idle longer than this are dropped
pub const RATE_CLIENT_TTL: Duration = Duration::from_secs(10 * 60);

/// Lazy sweep interval shared by the nonce cache and the limiter
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Largest WebSocket message accepted on the exec channel (1 MiB)
pub const MAX_WS_PAYLOAD_BYTES: usize = 1 << 20;

/// Per-frame read deadline on the exec channel
pub const WS_READ_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// PTY master read chunk size
pub const PTY_READ_CHUNK: usize = 4096;

/// Terminal geometry bounds
pub const MAX_PTY_COLS: u16 = 500;
pub const MAX_PTY_ROWS: u16 = 200;
pub const DEFAULT_PTY_COLS: u16 = 120;
pub const DEFAULT_PTY_ROWS: u16 = 32;

/// Deadline for one compose invocation
pub const COMPOSE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Deadline for resolving the default compose service
pub const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Deadline for an external /fs/fetch download
pub const EXTERNAL_FETCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Tail length requested from compose for the live log stream
pub const LOG_STREAM_TAIL: &str = "200";

/// Cap on the multipart `path` form value
pub const MAX_FORM_VALUE_BYTES: usize = 4096;

/// Cap on the /settings and /stack JSON bodies (1 MiB)
pub const MAX_CONFIG_FILE_BYTES: i64 = 1 << 20;

/// Bytes of an upstream error body echoed back by /fs/fetch
pub const FETCH_ERROR_ECHO_BYTES: usize = 1024;

/// Validate a stack name: non-empty, `[A-Za-z0-9_-]` only
#[inline]
pub fn validate_stack_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        Err("invalid stack name")
    } else if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        Err("invalid stack name")
    } else {
        Ok(())
    }
}

/// Validate a compose service name; empty means "default service"
#[inline]
pub fn validate_service_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Ok(());
    }
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        Ok(())
    } else {
        Err("invalid service name")
    }
}

/// Validate a requested terminal geometry
#[inline]
pub fn validate_terminal_size(cols: i64, rows: i64) -> Result<(), &'static str> {
    if cols <= 0 || rows <= 0 {
        Err("invalid terminal size")
    } else if cols > MAX_PTY_COLS as i64 || rows > MAX_PTY_ROWS as i64 {
        Err("terminal size exceeds limits")
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_name_validation() {
        assert!(validate_stack_name("").is_err());
        assert!(validate_stack_name("game-server_01").is_ok());
        assert!(validate_stack_name("my stack").is_err());
        assert!(validate_stack_name("../escape").is_err());
        assert!(validate_stack_name("a/b").is_err());
    }

    #[test]
    fn test_service_name_validation() {
        assert!(validate_service_name("").is_ok());
        assert!(validate_service_name("game").is_ok());
        assert!(validate_service_name("bad name").is_err());
    }

    #[test]
    fn test_terminal_size_validation() {
        assert!(validate_terminal_size(0, 24).is_err());
        assert!(validate_terminal_size(80, 0).is_err());
        assert!(validate_terminal_size(80, 24).is_ok());
        assert!(validate_terminal_size(MAX_PTY_COLS as i64, MAX_PTY_ROWS as i64).is_ok());
        assert!(validate_terminal_size(MAX_PTY_COLS as i64 + 1, 24).is_err());
        assert!(validate_terminal_size(80, MAX_PTY_ROWS as i64 + 1).is_err());
    }
}
