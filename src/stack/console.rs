//! Interactive console: WebSocket endpoint bridging the client to a
//! `docker attach` child through a PTY.
//!
//! Three actors share one cancellation token: the child waiter, the PTY
//! reader, and the WebSocket read loop. Whichever stops first cancels the
//! rest; teardown joins them all before the final log line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::{OnUpgrade, Upgraded};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::http::{ApiError, AppState};
use crate::limits::{validate_terminal_size, PTY_READ_CHUNK, SERVICE_RESOLVE_TIMEOUT, WS_READ_TIMEOUT};

use super::compose::run_compose_within;
use super::pty::{self, describe_exec_start_error, PtyMaster, TerminalSize};
use super::ws;
use super::{checked_service_name, resolve_stack_dir};

#[derive(Deserialize)]
pub struct ExecQuery {
    #[serde(default)]
    pub stack: String,
    #[serde(default)]
    pub service: String,
    pub cols: Option<i64>,
    pub rows: Option<i64>,
}

/// Wire format of console control frames, both directions.
#[derive(Serialize, Deserialize, Default)]
struct ExecWsMessage {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    msg_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    message: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    cols: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    rows: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i32>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

type WsSender = Arc<ws::ConnWriter>;

pub async fn stack_exec(
    State(state): State<AppState>,
    Query(query): Query<ExecQuery>,
    mut req: Request,
) -> Result<Response, ApiError> {
    // The platform gate answers before any upgrade negotiation.
    if !pty::pty_supported() {
        return Err(ApiError::NotImplemented(
            "interactive console is not supported on this worker platform".to_string(),
        ));
    }

    let base = state.settings.get().fs_base_path;
    let stack_dir = resolve_stack_dir(&base, &query.stack).await?;
    let mut service = checked_service_name(&query.service)?;
    if service.is_empty() {
        service = resolve_default_service(&stack_dir).await.map_err(|err| {
            warn!(action = "exec ws resolve service", stack = %query.stack, %err, "stack request rejected");
            ApiError::BadRequest("failed to resolve compose service; pass ?service=<name>".to_string())
        })?;
    }

    let size = TerminalSize::from_query(query.cols, query.rows);

    let accept = match ws::check_upgrade_headers(req.headers()) {
        Ok(accept) => accept,
        Err(err) => return Ok((err.status, err.message).into_response()),
    };
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        warn!(action = "exec ws upgrade", stack = %query.stack, "connection cannot be upgraded");
        return Err(ApiError::Internal("failed to upgrade websocket".to_string()));
    };

    let stack = query.stack.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => run_exec_session(upgraded, stack_dir, stack, service, size).await,
            Err(err) => {
                warn!(action = "exec ws upgrade", stack = %stack, %err, "websocket upgrade failed");
            }
        }
    });

    Ok((
        StatusCode::SWITCHING_PROTOCOLS,
        [
            (header::UPGRADE, "websocket".to_string()),
            (header::CONNECTION, "Upgrade".to_string()),
            (header::SEC_WEBSOCKET_ACCEPT, accept),
        ],
    )
        .into_response())
}

async fn resolve_default_service(stack_dir: &std::path::Path) -> anyhow::Result<String> {
    let output = run_compose_within(stack_dir, &["config", "--services"], SERVICE_RESOLVE_TIMEOUT).await?;
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("no services found"))
}

async fn run_exec_session(
    upgraded: Upgraded,
    stack_dir: std::path::PathBuf,
    stack: String,
    service: String,
    size: TerminalSize,
) {
    let (mut reader, writer) = ws::split_upgraded(upgraded);
    let sender: WsSender = Arc::new(writer);

    let (child, master) = match pty::start_compose_attach_pty(&stack_dir, &service, size).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(action = "exec ws start", stack = %stack, service = %service, %err, "console start failed");
            let _ = send_control(
                &sender,
                ExecWsMessage {
                    msg_type: "error".to_string(),
                    message: describe_exec_start_error(&err).to_string(),
                    ..ExecWsMessage::default()
                },
            )
            .await;
            sender.shutdown().await;
            return;
        }
    };
    let master = Arc::new(master);

    info!(action = "exec ws start", stack = %stack, service = %service, "stack operation");

    let token = CancellationToken::new();
    let child_exited = Arc::new(AtomicBool::new(false));

    let waiter = tokio::spawn(waiter_task(child, sender.clone(), token.clone(), child_exited.clone()));
    let pump = tokio::spawn(pty_to_ws(master.clone(), sender.clone(), token.clone()));

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = timeout(WS_READ_TIMEOUT, reader.read_frame()) => frame,
        };

        let (opcode, payload) = match frame {
            // Per-frame deadline elapsed, protocol error, or the socket
            // ended; all of them end the session.
            Err(_) | Ok(Err(_)) => break,
            Ok(Ok(frame)) => frame,
        };

        match opcode {
            ws::OPCODE_TEXT | ws::OPCODE_BINARY => {
                if handle_client_payload(payload, &master, &sender, &token).await.is_err() {
                    break;
                }
            }
            ws::OPCODE_PING => {
                let _ = sender.write_frame(ws::OPCODE_PONG, &payload).await;
            }
            ws::OPCODE_PONG => {}
            ws::OPCODE_CLOSE => {
                let _ = sender.write_frame(ws::OPCODE_CLOSE, &payload).await;
                break;
            }
            _ => {}
        }
    }

    token.cancel();
    let _ = waiter.await;
    let _ = pump.await;
    sender.shutdown().await;

    let reason = if child_exited.load(Ordering::SeqCst) {
        "command_exit"
    } else {
        "client_disconnect"
    };
    info!(action = "exec ws stop", stack = %stack, service = %service, reason, "stack operation");
}

/// Await the attach child. On a natural exit, report the error (if any) and
/// the exit code, then stop the session. On cancellation, kill and reap.
async fn waiter_task(mut child: Child, sender: WsSender, token: CancellationToken, child_exited: Arc<AtomicBool>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = token.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return;
        }
    };

    child_exited.store(true, Ordering::SeqCst);
    if token.is_cancelled() {
        return;
    }

    let code = match status {
        Ok(status) => {
            if !status.success() {
                let _ = send_control(
                    &sender,
                    ExecWsMessage {
                        msg_type: "error".to_string(),
                        message: "interactive session exited with an error".to_string(),
                        ..ExecWsMessage::default()
                    },
                )
                .await;
            }
            status.code().unwrap_or(-1)
        }
        Err(_) => -1,
    };

    let _ = send_control(
        &sender,
        ExecWsMessage {
            msg_type: "exit".to_string(),
            code: Some(code),
            ..ExecWsMessage::default()
        },
    )
    .await;

    token.cancel();
}

/// Pump PTY output to the client in bounded chunks.
async fn pty_to_ws(master: Arc<PtyMaster>, sender: WsSender, token: CancellationToken) {
    let mut buf = vec![0u8; PTY_READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = master.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                token.cancel();
                break;
            }
            Ok(n) => {
                let frame = ExecWsMessage {
                    msg_type: "output".to_string(),
                    data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                    ..ExecWsMessage::default()
                };
                if send_control(&sender, frame).await.is_err() {
                    token.cancel();
                    break;
                }
            }
            Err(_) => {
                if !token.is_cancelled() {
                    let _ = send_control(
                        &sender,
                        ExecWsMessage {
                            msg_type: "error".to_string(),
                            message: "terminal stream closed unexpectedly".to_string(),
                            ..ExecWsMessage::default()
                        },
                    )
                    .await;
                }
                token.cancel();
                break;
            }
        }
    }
}

/// One client frame: JSON control message, or raw bytes for legacy clients.
async fn handle_client_payload(
    payload: Vec<u8>,
    master: &PtyMaster,
    sender: &WsSender,
    token: &CancellationToken,
) -> Result<(), ()> {
    if let Ok(msg) = serde_json::from_slice::<ExecWsMessage>(&payload) {
        if !msg.msg_type.is_empty() {
            match msg.msg_type.as_str() {
                "input" => {
                    if msg.data.is_empty() {
                        return Ok(());
                    }
                    if master.write_all(msg.data.as_bytes()).await.is_err() {
                        token.cancel();
                        return Err(());
                    }
                }
                "resize" => {
                    let outcome = match validate_terminal_size(msg.cols, msg.rows) {
                        Ok(()) => master
                            .resize(TerminalSize {
                                cols: msg.cols as u16,
                                rows: msg.rows as u16,
                            })
                            .map_err(|err| err.to_string()),
                        Err(msg) => Err(msg.to_string()),
                    };
                    if let Err(message) = outcome {
                        let _ = send_control(
                            sender,
                            ExecWsMessage {
                                msg_type: "error".to_string(),
                                message,
                                ..ExecWsMessage::default()
                            },
                        )
                        .await;
                    }
                }
                _ => {}
            }
            return Ok(());
        }
    }

    if !payload.is_empty() {
        if master.write_all(&payload).await.is_err() {
            token.cancel();
            return Err(());
        }
    }
    Ok(())
}

async fn send_control(sender: &WsSender, msg: ExecWsMessage) -> std::io::Result<()> {
    let text = serde_json::to_string(&msg).expect("console frame serializes");
    sender.write_frame(ws::OPCODE_TEXT, text.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_wire_format() {
        let exit = ExecWsMessage {
            msg_type: "exit".to_string(),
            code: Some(0),
            ..ExecWsMessage::default()
        };
        assert_eq!(serde_json::to_string(&exit).unwrap(), r#"{"type":"exit","code":0}"#);

        let output = ExecWsMessage {
            msg_type: "output".to_string(),
            data: "hi".to_string(),
            ..ExecWsMessage::default()
        };
        assert_eq!(serde_json::to_string(&output).unwrap(), r#"{"type":"output","data":"hi"}"#);
    }

    #[test]
    fn test_client_frames_parse() {
        let msg: ExecWsMessage = serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert_eq!(msg.msg_type, "input");
        assert_eq!(msg.data, "ls\n");

        let msg: ExecWsMessage = serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg.msg_type, "resize");
        assert_eq!((msg.cols, msg.rows), (120, 40));

        // A bare text payload is not a control frame.
        assert!(serde_json::from_str::<ExecWsMessage>("echo hi").is_err());
    }
}
