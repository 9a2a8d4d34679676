//! Bulk transfer: streamed download and multipart upload.

use std::error::Error as StdError;

use axum::body::Body;
use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use http_body_util::Limited;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::http::{ApiError, AppState};
use crate::limits::MAX_FORM_VALUE_BYTES;

use super::handlers::PathQuery;
use super::sandboxed;

pub async fn download_file(State(state): State<AppState>, Query(query): Query<PathQuery>) -> Result<Response, ApiError> {
    if query.path.is_empty() {
        return Err(ApiError::BadRequest("missing path".to_string()));
    }

    let base = state.settings.get().fs_base_path;
    let full_path = sandboxed(&base, &query.path).inspect_err(|err| {
        warn!(action = "download", path = %query.path, %err, "fs request rejected");
    })?;

    let meta = tokio::fs::metadata(&full_path).await.map_err(|err| {
        warn!(action = "download", path = %query.path, %err, "fs download failed");
        ApiError::NotFound("file not found".to_string())
    })?;
    if meta.is_dir() {
        return Err(ApiError::BadRequest("path is a directory".to_string()));
    }

    let file = tokio::fs::File::open(&full_path).await.map_err(|err| {
        warn!(action = "download", path = %query.path, %err, "fs download failed");
        ApiError::Internal("cannot open file".to_string())
    })?;

    let filename = full_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let disposition = format!("attachment; filename=\"{filename}\"");

    info!(action = "download", path = %query.path, bytes = meta.len(), "fs operation");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

pub async fn upload_file(State(state): State<AppState>, req: Request) -> Result<Response, ApiError> {
    let cap = usize::try_from(state.settings.get().max_upload_bytes()).unwrap_or(usize::MAX);

    let (parts, body) = req.into_parts();
    let limited = Request::from_parts(parts, Body::new(Limited::new(body, cap)));
    let mut multipart = Multipart::from_request(limited, &())
        .await
        .map_err(|_| ApiError::BadRequest("invalid multipart form".to_string()))?;

    let mut path = String::new();
    let mut uploaded = false;
    let mut uploaded_bytes: u64 = 0;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(action = "upload", path = %path, %err, "multipart read failed");
                return Err(multipart_error(err));
            }
        };

        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("path") => {
                let value = field.text().await.map_err(|err| {
                    warn!(action = "upload", %err, "multipart read failed");
                    multipart_error(err)
                })?;
                let value = value.trim().to_string();
                if value.len() > MAX_FORM_VALUE_BYTES {
                    return Err(ApiError::BadRequest("invalid multipart form".to_string()));
                }
                path = value;
            }
            Some("file") => {
                if path.is_empty() {
                    return Err(ApiError::BadRequest("missing path".to_string()));
                }
                uploaded_bytes = save_upload_field(&state, &path, field).await?;
                uploaded = true;
            }
            _ => {
                // Unknown fields are drained and ignored.
                let mut field = field;
                while let Some(_chunk) = field.chunk().await.map_err(multipart_error)? {}
            }
        }
    }

    if !uploaded {
        return Err(ApiError::BadRequest("missing file".to_string()));
    }

    info!(action = "upload", path = %path, bytes = uploaded_bytes, "fs operation");
    Ok(().into_response())
}

async fn save_upload_field(
    state: &AppState,
    path: &str,
    mut field: axum::extract::multipart::Field<'_>,
) -> Result<u64, ApiError> {
    let base = state.settings.get().fs_base_path;
    let full_path = sandboxed(&base, path).inspect_err(|err| {
        warn!(action = "upload", path, %err, "fs request rejected");
    })?;

    if let Some(parent) = full_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            warn!(action = "upload", path, %err, "mkdir failed");
            ApiError::Internal("cannot create directories".to_string())
        })?;
    }

    let mut out = tokio::fs::File::create(&full_path).await.map_err(|err| {
        warn!(action = "upload", path, %err, "cannot create file");
        ApiError::Internal("cannot create file".to_string())
    })?;

    let mut written: u64 = 0;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                let _ = tokio::fs::remove_file(&full_path).await;
                warn!(action = "upload", path, %err, "upload stream failed");
                return Err(multipart_error(err));
            }
        };
        if let Err(err) = out.write_all(&chunk).await {
            let _ = tokio::fs::remove_file(&full_path).await;
            warn!(action = "upload", path, copied = written, %err, "cannot write file");
            return Err(ApiError::Internal("cannot write file".to_string()));
        }
        written += chunk.len() as u64;
    }

    if let Err(err) = out.flush().await {
        let _ = tokio::fs::remove_file(&full_path).await;
        warn!(action = "upload", path, %err, "cannot write file");
        return Err(ApiError::Internal("cannot write file".to_string()));
    }

    Ok(written)
}

/// Distinguish the body-cap trip from a malformed form.
fn multipart_error(err: MultipartError) -> ApiError {
    let mut source: Option<&(dyn StdError + 'static)> = Some(&err);
    while let Some(current) = source {
        if current.is::<http_body_util::LengthLimitError>() {
            return ApiError::PayloadTooLarge("upload too large".to_string());
        }
        source = current.source();
    }
    ApiError::BadRequest("invalid multipart form".to_string())
}
