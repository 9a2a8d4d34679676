//! Inline file read and write.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};

use crate::http::{read_body_limited, ApiError, AppState};

use super::sandboxed;

#[derive(Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Deserialize)]
struct WriteRequest {
    #[serde(default)]
    path: String,
    #[serde(default)]
    content: String,
}

pub async fn read_file(State(state): State<AppState>, Query(query): Query<PathQuery>) -> Result<Response, ApiError> {
    if query.path.is_empty() {
        return Err(ApiError::BadRequest("missing path".to_string()));
    }

    let base = state.settings.get().fs_base_path;
    let full_path = sandboxed(&base, &query.path).inspect_err(|err| {
        warn!(action = "read", path = %query.path, %err, "fs request rejected");
    })?;

    let data = tokio::fs::read(&full_path).await.map_err(|err| {
        warn!(action = "read", path = %query.path, %err, "fs read failed");
        if err.kind() == std::io::ErrorKind::NotFound {
            ApiError::NotFound("file not found".to_string())
        } else {
            ApiError::Internal("cannot read file".to_string())
        }
    })?;

    info!(action = "read", path = %query.path, "fs operation");
    Ok(Body::from(data).into_response())
}

pub async fn write_file(State(state): State<AppState>, body: Body) -> Result<Response, ApiError> {
    let cap = state.settings.get().max_inline_write_bytes();
    let bytes = read_body_limited(body, cap).await?;
    let req: WriteRequest =
        serde_json::from_slice(&bytes).map_err(|_| ApiError::BadRequest("invalid json".to_string()))?;

    let base = state.settings.get().fs_base_path;
    let full_path = sandboxed(&base, &req.path).inspect_err(|err| {
        warn!(action = "write", path = %req.path, %err, "fs request rejected");
    })?;

    if let Some(parent) = full_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            warn!(action = "write", path = %req.path, %err, "mkdir failed");
            ApiError::Internal("cannot create directories".to_string())
        })?;
    }

    tokio::fs::write(&full_path, req.content.as_bytes()).await.map_err(|err| {
        warn!(action = "write", path = %req.path, %err, "fs write failed");
        ApiError::Internal("cannot write file".to_string())
    })?;

    info!(action = "write", path = %req.path, bytes = req.content.len(), "fs operation");
    Ok(().into_response())
}
