//! Fetch a remote URL into the sandbox: stream to a temp sibling, then
//! rename into place. The temp file is removed on every error path.

use std::io::Write;
use std::sync::OnceLock;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use crate::http::{read_body_limited, ApiError, AppState};
use crate::limits::{EXTERNAL_FETCH_TIMEOUT, FETCH_ERROR_ECHO_BYTES};

use super::sandboxed;

#[derive(Deserialize)]
struct FetchRequest {
    #[serde(default)]
    path: String,
    #[serde(default)]
    url: String,
    #[serde(default, rename = "maxBytes")]
    max_bytes: i64,
}

fn fetch_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(EXTERNAL_FETCH_TIMEOUT)
            .user_agent("vestri-worker/1")
            .build()
            .expect("static fetch client")
    })
}

pub async fn fetch_remote_file(State(state): State<AppState>, body: Body) -> Result<Response, ApiError> {
    let cfg = state.settings.get();
    let bytes = read_body_limited(body, cfg.max_archive_request_bytes()).await?;
    let req: FetchRequest =
        serde_json::from_slice(&bytes).map_err(|_| ApiError::BadRequest("invalid json".to_string()))?;

    let path = req.path.trim().to_string();
    let url = req.url.trim().to_string();
    if path.is_empty() {
        return Err(ApiError::BadRequest("missing path".to_string()));
    }
    if url.is_empty() {
        return Err(ApiError::BadRequest("missing url".to_string()));
    }

    let parsed = reqwest::Url::parse(&url).map_err(|_| ApiError::BadRequest("invalid external url".to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ApiError::BadRequest("invalid external url".to_string()));
    }

    let mut ceiling = cfg.max_upload_bytes();
    if req.max_bytes > 0 && req.max_bytes < ceiling {
        ceiling = req.max_bytes;
    }
    let ceiling = ceiling as u64;

    let full_path = sandboxed(&cfg.fs_base_path, &path).inspect_err(|err| {
        warn!(action = "fetch", path = %path, %err, "fs request rejected");
    })?;
    let parent = full_path
        .parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| ApiError::Internal("cannot create directories".to_string()))?;
    tokio::fs::create_dir_all(&parent).await.map_err(|err| {
        warn!(action = "fetch", path = %path, %err, "mkdir failed");
        ApiError::Internal("cannot create directories".to_string())
    })?;

    let resp = fetch_client().get(parsed).send().await.map_err(|err| {
        warn!(action = "fetch", path = %path, url = %url, %err, "download failed");
        ApiError::Upstream("failed to download file".to_string())
    })?;

    let status = resp.status();
    if !status.is_success() {
        let echo = read_error_echo(resp).await;
        warn!(action = "fetch", path = %path, url = %url, status = status.as_u16(), "upstream error");
        return Err(ApiError::Upstream(echo));
    }

    if let Some(length) = resp.content_length() {
        if length > ceiling {
            warn!(action = "fetch", path = %path, url = %url, length, "download exceeds size limit");
            return Err(ApiError::PayloadTooLarge("download exceeds size limit".to_string()));
        }
    }

    // Temp sibling in the final directory keeps the rename on one
    // filesystem; drop removes it on any error below.
    let mut temp = tempfile::Builder::new()
        .prefix(".fetch-")
        .tempfile_in(&parent)
        .map_err(|err| {
            warn!(action = "fetch", path = %path, %err, "cannot create temporary file");
            ApiError::Internal("cannot create temporary file".to_string())
        })?;

    let mut written: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            warn!(action = "fetch", path = %path, url = %url, %err, "download stream failed");
            ApiError::Internal("cannot write downloaded file".to_string())
        })?;
        written += chunk.len() as u64;
        if written > ceiling {
            warn!(action = "fetch", path = %path, url = %url, written, "download exceeds size limit");
            return Err(ApiError::PayloadTooLarge("download exceeds size limit".to_string()));
        }
        temp.as_file_mut().write_all(&chunk).map_err(|err| {
            warn!(action = "fetch", path = %path, %err, "cannot write downloaded file");
            ApiError::Internal("cannot write downloaded file".to_string())
        })?;
    }

    temp.as_file_mut().flush().map_err(|err| {
        warn!(action = "fetch", path = %path, %err, "cannot finalize downloaded file");
        ApiError::Internal("cannot finalize downloaded file".to_string())
    })?;

    temp.persist(&full_path).map_err(|err| {
        warn!(action = "fetch", path = %path, %err, "cannot move downloaded file");
        ApiError::Internal("cannot move downloaded file".to_string())
    })?;

    info!(action = "fetch", path = %path, url = %url, bytes = written, "fs operation");
    Ok(().into_response())
}

/// Read at most the first kibibyte of an upstream error body for the
/// response text.
async fn read_error_echo(resp: reqwest::Response) -> String {
    let mut collected: Vec<u8> = Vec::new();
    let mut stream = resp.bytes_stream();
    while collected.len() < FETCH_ERROR_ECHO_BYTES {
        match stream.next().await {
            Some(Ok(chunk)) => {
                let take = (FETCH_ERROR_ECHO_BYTES - collected.len()).min(chunk.len());
                collected.extend_from_slice(&chunk[..take]);
            }
            _ => break,
        }
    }
    String::from_utf8_lossy(&collected).trim().to_string()
}
