//! Live log streaming: `compose logs -f` piped straight into the response
//! body. The child is killed when the client goes away.

use std::process::Stdio;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::http::{ApiError, AppState};
use crate::limits::LOG_STREAM_TAIL;

use super::compose::compose_command;
use super::{checked_service_name, resolve_stack_dir};

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub stack: String,
    #[serde(default)]
    pub service: String,
}

pub async fn stack_logs_stream(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Result<Response, ApiError> {
    let base = state.settings.get().fs_base_path;
    let stack_dir = resolve_stack_dir(&base, &query.stack).await?;
    let service = checked_service_name(&query.service)?;

    let tail = format!("--tail={LOG_STREAM_TAIL}");
    let mut args = vec!["logs", "-f", "--no-color", tail.as_str()];
    if !service.is_empty() {
        args.push(service.as_str());
    }

    let mut cmd = compose_command(&stack_dir, &args);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|err| {
        warn!(action = "logs stream", stack = %query.stack, %err, "spawn failed");
        ApiError::Internal("failed to start compose logs command".to_string())
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    let service_label = if service.is_empty() { "all".to_string() } else { service.clone() };
    let banner = format!("[vestri] live log stream connected (service={service_label})\n");
    let _ = tx.try_send(Ok(Bytes::from(banner)));

    if let Some(stdout) = stdout {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = stderr {
        tokio::spawn(pump(stderr, tx.clone()));
    }

    let stack = query.stack.clone();
    let service_log = service.clone();
    tokio::spawn(async move {
        wait_child(child, tx, &stack, &service_log).await;
    });

    info!(action = "logs stream start", stack = %query.stack, service = %service, "stack operation");

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

async fn pump(mut reader: impl tokio::io::AsyncRead + Unpin, tx: mpsc::Sender<Result<Bytes, std::io::Error>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Wait for the child, or kill it once the response body is dropped.
async fn wait_child(mut child: Child, tx: mpsc::Sender<Result<Bytes, std::io::Error>>, stack: &str, service: &str) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(_) => info!(action = "logs stream stop", stack, service, reason = "command_exit", "stack operation"),
                Err(err) => warn!(action = "logs stream stop", stack, service, %err, "compose logs wait failed"),
            }
        }
        _ = tx.closed() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            info!(action = "logs stream stop", stack, service, reason = "client_disconnect", "stack operation");
        }
    }
}
