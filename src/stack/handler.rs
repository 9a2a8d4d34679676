//! Stack lifecycle handlers: up, down, restart, status.
//!
//! The compose child's combined output is the response body either way; a
//! failing child maps to 500 with whatever the tool printed.

use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};

use crate::http::{read_body_limited, ApiError, AppState};
use crate::limits::MAX_CONFIG_FILE_BYTES;

use super::compose::{run_compose, ComposeError};
use super::resolve_stack_dir;

#[derive(Deserialize)]
struct StackRequest {
    #[serde(default)]
    stack: String,
}

#[derive(Deserialize)]
pub struct StackQuery {
    #[serde(default)]
    pub stack: String,
}

async fn stack_from_body(state: &AppState, body: Body) -> Result<(PathBuf, String), ApiError> {
    let bytes = read_body_limited(body, MAX_CONFIG_FILE_BYTES).await?;
    let req: StackRequest =
        serde_json::from_slice(&bytes).map_err(|err| ApiError::BadRequest(format!("bad request: {err}")))?;
    let base = state.settings.get().fs_base_path;
    let dir = resolve_stack_dir(&base, &req.stack).await?;
    Ok((dir, req.stack))
}

fn compose_response(result: Result<String, ComposeError>, action: &str, stack: &str) -> Result<Response, ApiError> {
    match result {
        Ok(output) => {
            info!(action, stack, "stack operation");
            Ok(output.into_response())
        }
        Err(ComposeError::Failed { output }) => {
            warn!(action, stack, "compose command failed");
            Err(ApiError::Internal(output))
        }
        Err(err) => {
            warn!(action, stack, %err, "compose command error");
            Err(ApiError::Internal(err.to_string()))
        }
    }
}

pub async fn stack_up(State(state): State<AppState>, body: Body) -> Result<Response, ApiError> {
    let (dir, stack) = stack_from_body(&state, body).await?;
    compose_response(run_compose(&dir, &["up", "-d"]).await, "up", &stack)
}

pub async fn stack_down(State(state): State<AppState>, body: Body) -> Result<Response, ApiError> {
    let (dir, stack) = stack_from_body(&state, body).await?;
    compose_response(run_compose(&dir, &["down"]).await, "down", &stack)
}

pub async fn stack_restart(State(state): State<AppState>, body: Body) -> Result<Response, ApiError> {
    let (dir, stack) = stack_from_body(&state, body).await?;
    if let Err(err) = run_compose(&dir, &["down"]).await {
        return compose_response(Err(err), "restart down", &stack);
    }
    compose_response(run_compose(&dir, &["up", "-d"]).await, "restart", &stack)
}

pub async fn stack_status(State(state): State<AppState>, Query(query): Query<StackQuery>) -> Result<Response, ApiError> {
    let base = state.settings.get().fs_base_path;
    let dir = resolve_stack_dir(&base, &query.stack).await?;
    compose_response(run_compose(&dir, &["ps"]).await, "status", &query.stack)
}
