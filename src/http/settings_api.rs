//! Settings endpoints: GET returns the raw persisted file, POST merges the
//! operator-editable fields and persists atomically with the install.

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{error, info};

use crate::limits::MAX_CONFIG_FILE_BYTES;

use super::error::ApiError;
use super::{read_body_limited, AppState};

#[derive(Deserialize)]
pub struct SettingsUpdate {
    pub http_port: Option<String>,
    pub fs_base_path: Option<String>,
}

pub async fn get_settings(State(state): State<AppState>) -> Result<Response, ApiError> {
    let raw = tokio::fs::read(state.settings.path()).await.map_err(|err| {
        error!(path = %state.settings.path().display(), %err, "cannot read settings file");
        ApiError::Internal("cannot read settings".to_string())
    })?;
    Ok(([(header::CONTENT_TYPE, "application/json")], raw).into_response())
}

pub async fn update_settings(State(state): State<AppState>, body: Body) -> Result<Response, ApiError> {
    let bytes = read_body_limited(body, MAX_CONFIG_FILE_BYTES).await?;
    let update: SettingsUpdate =
        serde_json::from_slice(&bytes).map_err(|_| ApiError::BadRequest("invalid json".to_string()))?;

    let mut current = state.settings.get();
    if let Some(http_port) = update.http_port {
        current.http_port = http_port;
    }
    if let Some(fs_base_path) = update.fs_base_path {
        current.fs_base_path = fs_base_path;
    }

    state.settings.persist(&current).map_err(|err| {
        error!(%err, "cannot persist settings");
        ApiError::Internal("cannot write settings".to_string())
    })?;
    state.settings.set(current);

    info!("settings updated");
    Ok(().into_response())
}
