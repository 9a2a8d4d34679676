//! Directory listing.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::http::{ApiError, AppState};

use super::sandboxed;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Serialize)]
pub struct ListEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: &'static str,
    pub size: i64,
}

pub async fn list_dir(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<Json<Vec<ListEntry>>, ApiError> {
    let path = if query.path.is_empty() { "." } else { query.path.as_str() };

    let base = state.settings.get().fs_base_path;
    let full_path = sandboxed(&base, path).inspect_err(|err| {
        warn!(action = "list", path, %err, "fs request rejected");
    })?;

    let meta = tokio::fs::metadata(&full_path).await.map_err(|err| {
        warn!(action = "list", path, %err, "fs list failed");
        if err.kind() == std::io::ErrorKind::NotFound {
            ApiError::NotFound("directory not found".to_string())
        } else {
            ApiError::Internal("cannot access directory".to_string())
        }
    })?;
    if !meta.is_dir() {
        return Err(ApiError::BadRequest("path is not a directory".to_string()));
    }

    let mut read_dir = tokio::fs::read_dir(&full_path).await.map_err(|err| {
        warn!(action = "list", path, %err, "fs list failed");
        ApiError::Internal("cannot read directory".to_string())
    })?;

    let mut result = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(|err| {
        warn!(action = "list", path, %err, "fs list failed");
        ApiError::Internal("cannot read directory".to_string())
    })? {
        let file_type = entry.file_type().await.ok();
        let entry_type = match file_type {
            Some(ft) if ft.is_dir() => "dir",
            Some(ft) if ft.is_symlink() => "symlink",
            Some(ft) if ft.is_file() => "file",
            Some(_) => "other",
            None => "other",
        };
        // Entry metadata does not follow symlinks, matching the type above.
        let size = entry.metadata().await.map(|m| m.len() as i64).unwrap_or(0);
        result.push(ListEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            entry_type,
            size,
        });
    }
    result.sort_by(|a, b| a.name.cmp(&b.name));

    info!(action = "list", path, entries = result.len(), "fs operation");
    Ok(Json(result))
}
