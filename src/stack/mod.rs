//! Stack management: compose lifecycle, live logs, and the interactive
//! console. A stack is a sandboxed directory under the filesystem base
//! holding a `docker-compose.yml`.

pub mod compose;
mod console;
mod handler;
mod logs;
pub mod pty;
mod ws;

pub use console::stack_exec;
pub use handler::{stack_down, stack_restart, stack_status, stack_up};
pub use logs::stack_logs_stream;

use std::path::{Path, PathBuf};

use crate::fs::safepath::safe_sub_path;
use crate::http::ApiError;
use crate::limits::{validate_service_name, validate_stack_name};

/// Resolve and create the directory for `stack` beneath the sandbox base.
pub(crate) async fn resolve_stack_dir(base: &str, stack: &str) -> Result<PathBuf, ApiError> {
    validate_stack_name(stack).map_err(|msg| ApiError::BadRequest(msg.to_string()))?;

    let stack_dir = safe_sub_path(Path::new(base), stack)
        .map_err(|err| ApiError::BadRequest(format!("invalid stack path: {err}")))?;

    tokio::fs::create_dir_all(&stack_dir)
        .await
        .map_err(|_| ApiError::BadRequest("failed to create stack directory".to_string()))?;

    Ok(stack_dir)
}

pub(crate) fn checked_service_name(service: &str) -> Result<String, ApiError> {
    validate_service_name(service).map_err(|msg| ApiError::BadRequest(msg.to_string()))?;
    Ok(service.to_string())
}
