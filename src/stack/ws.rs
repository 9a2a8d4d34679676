//! RFC 6455 server-side framing over an upgraded connection.
//!
//! The console channel is point-to-point, so the codec is deliberately
//! narrow: client frames must be masked, fragmented and continuation frames
//! are rejected outright, and payloads are bounded. Writes are single
//! unmasked frames serialized by a mutex and flushed immediately.

use std::io;

use axum::http::{HeaderMap, StatusCode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::limits::MAX_WS_PAYLOAD_BYTES;

pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xA;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug)]
pub struct WsUpgradeError {
    pub status: StatusCode,
    pub message: &'static str,
}

/// Validate the client's upgrade request; returns the Sec-WebSocket-Accept
/// value for the 101 response.
pub fn check_upgrade_headers(headers: &HeaderMap) -> Result<String, WsUpgradeError> {
    let upgrade_ok = headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !header_contains_token(headers, "connection", "upgrade") || !upgrade_ok {
        return Err(WsUpgradeError {
            status: StatusCode::BAD_REQUEST,
            message: "websocket upgrade required",
        });
    }

    let version = headers
        .get("sec-websocket-version")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if version != "13" {
        return Err(WsUpgradeError {
            status: StatusCode::UPGRADE_REQUIRED,
            message: "unsupported websocket version",
        });
    }

    let key = headers
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if key.is_empty() {
        return Err(WsUpgradeError {
            status: StatusCode::BAD_REQUEST,
            message: "missing websocket key",
        });
    }

    Ok(accept_key(key))
}

pub fn accept_key(key: &str) -> String {
    let digest = Sha1::digest(format!("{key}{WEBSOCKET_GUID}").as_bytes());
    BASE64.encode(digest)
}

fn header_contains_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|piece| piece.trim().eq_ignore_ascii_case(token))
}

pub type UpgradedIo = TokioIo<Upgraded>;
pub type ConnReader = WsReader<ReadHalf<UpgradedIo>>;
pub type ConnWriter = WsWriter<WriteHalf<UpgradedIo>>;

/// Split an upgraded connection into framed read and write halves.
pub fn split_upgraded(upgraded: Upgraded) -> (ConnReader, ConnWriter) {
    let (read, write) = tokio::io::split(TokioIo::new(upgraded));
    (WsReader::new(read), WsWriter::new(write))
}

pub struct WsReader<R> {
    io: BufReader<R>,
}

impl<R: AsyncRead + Unpin> WsReader<R> {
    pub fn new(io: R) -> Self {
        Self { io: BufReader::new(io) }
    }

    /// Read one complete frame and return `(opcode, unmasked payload)`.
    /// Fragmented or continuation frames, unmasked payloads, and payloads
    /// over the cap are protocol errors; the caller tears the session down.
    pub async fn read_frame(&mut self) -> io::Result<(u8, Vec<u8>)> {
        let mut header = [0u8; 2];
        self.io.read_exact(&mut header).await?;

        let fin = header[0] & 0x80 != 0;
        let opcode = header[0] & 0x0F;
        if !fin {
            return Err(protocol_error("fragmented websocket frames are unsupported"));
        }
        if opcode == OPCODE_CONTINUATION {
            return Err(protocol_error("continuation websocket frames are unsupported"));
        }

        if header[1] & 0x80 == 0 {
            return Err(protocol_error("unmasked websocket payloads are unsupported"));
        }

        let mut payload_len = u64::from(header[1] & 0x7F);
        if payload_len == 126 {
            let mut ext = [0u8; 2];
            self.io.read_exact(&mut ext).await?;
            payload_len = u64::from(u16::from_be_bytes(ext));
        } else if payload_len == 127 {
            let mut ext = [0u8; 8];
            self.io.read_exact(&mut ext).await?;
            payload_len = u64::from_be_bytes(ext);
        }
        if payload_len > MAX_WS_PAYLOAD_BYTES as u64 {
            return Err(protocol_error("websocket payload exceeds limit"));
        }

        let mut mask = [0u8; 4];
        self.io.read_exact(&mut mask).await?;

        let mut payload = vec![0u8; payload_len as usize];
        if payload_len > 0 {
            self.io.read_exact(&mut payload).await?;
        }
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        Ok((opcode, payload))
    }
}

pub struct WsWriter<W> {
    io: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> WsWriter<W> {
    pub fn new(io: W) -> Self {
        Self { io: Mutex::new(io) }
    }

    /// Write one unmasked frame with the matching length encoding, then
    /// flush so the client sees it immediately.
    pub async fn write_frame(&self, opcode: u8, payload: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 10);
        frame.push(0x80 | opcode);
        match payload.len() {
            len if len <= 125 => frame.push(len as u8),
            len if len <= 65535 => {
                frame.push(126);
                frame.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                frame.push(127);
                frame.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        frame.extend_from_slice(payload);

        let mut io = self.io.lock().await;
        io.write_all(&frame).await?;
        io.flush().await
    }

    /// Half-close the connection after the final frame.
    pub async fn shutdown(&self) {
        let mut io = self.io.lock().await;
        let _ = io.shutdown().await;
    }
}

fn protocol_error(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tokio::io::AsyncWriteExt;

    fn client_frame(fin: bool, opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut frame = Vec::new();
        let first = if fin { 0x80 | opcode } else { opcode };
        frame.push(first);
        match payload.len() {
            len if len <= 125 => frame.push(0x80 | len as u8),
            len if len <= 65535 => {
                frame.push(0x80 | 126);
                frame.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                frame.push(0x80 | 127);
                frame.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        frame
    }

    #[test]
    fn test_accept_key_rfc_vector() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_check_upgrade_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("sec-websocket-version", HeaderValue::from_static("13"));
        headers.insert("sec-websocket-key", HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_eq!(check_upgrade_headers(&headers).unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");

        let mut wrong_version = headers.clone();
        wrong_version.insert("sec-websocket-version", HeaderValue::from_static("8"));
        let err = check_upgrade_headers(&wrong_version).unwrap_err();
        assert_eq!(err.status, StatusCode::UPGRADE_REQUIRED);

        let mut no_key = headers.clone();
        no_key.remove("sec-websocket-key");
        let err = check_upgrade_headers(&no_key).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let mut no_upgrade = headers.clone();
        no_upgrade.remove("upgrade");
        let err = check_upgrade_headers(&no_upgrade).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_read_masked_text_frame() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = WsReader::new(server);

        let frame = client_frame(true, OPCODE_TEXT, b"echo hi", [0x11, 0x22, 0x33, 0x44]);
        client.write_all(&frame).await.unwrap();

        let (opcode, payload) = reader.read_frame().await.unwrap();
        assert_eq!(opcode, OPCODE_TEXT);
        assert_eq!(payload, b"echo hi");
    }

    #[tokio::test]
    async fn test_extended_length_frame() {
        let (mut client, server) = tokio::io::duplex(65536);
        let mut reader = WsReader::new(server);

        let payload = vec![7u8; 300];
        let frame = client_frame(true, OPCODE_BINARY, &payload, [9, 9, 9, 9]);
        client.write_all(&frame).await.unwrap();

        let (opcode, got) = reader.read_frame().await.unwrap();
        assert_eq!(opcode, OPCODE_BINARY);
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn test_fragmented_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = WsReader::new(server);

        // FIN = 0 on a text frame.
        let frame = client_frame(false, OPCODE_TEXT, b"part one", [1, 2, 3, 4]);
        client.write_all(&frame).await.unwrap();

        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("fragmented"));
    }

    #[tokio::test]
    async fn test_continuation_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = WsReader::new(server);

        let frame = client_frame(true, OPCODE_CONTINUATION, b"tail", [1, 2, 3, 4]);
        client.write_all(&frame).await.unwrap();

        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("continuation"));
    }

    #[tokio::test]
    async fn test_unmasked_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = WsReader::new(server);

        // Server-style frame from the client: no mask bit.
        client.write_all(&[0x80 | OPCODE_TEXT, 2, b'h', b'i']).await.unwrap();

        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("unmasked"));
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = WsReader::new(server);

        // Declared 64-bit length one past the cap; rejected before any
        // payload is read.
        let mut header = vec![0x80 | OPCODE_BINARY, 0x80 | 127];
        header.extend_from_slice(&((MAX_WS_PAYLOAD_BYTES as u64 + 1).to_be_bytes()));
        client.write_all(&header).await.unwrap();

        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn test_payload_at_cap_accepted() {
        // Buffer comfortably larger than the frame so the write completes
        // before the read starts.
        let (mut client, server) = tokio::io::duplex(MAX_WS_PAYLOAD_BYTES * 2 + 64);
        let mut reader = WsReader::new(server);

        let payload = vec![3u8; MAX_WS_PAYLOAD_BYTES];
        let frame = client_frame(true, OPCODE_BINARY, &payload, [5, 6, 7, 8]);
        client.write_all(&frame).await.unwrap();

        let (opcode, got) = reader.read_frame().await.unwrap();
        assert_eq!(opcode, OPCODE_BINARY);
        assert_eq!(got.len(), MAX_WS_PAYLOAD_BYTES);
    }

    #[tokio::test]
    async fn test_write_frame_encodings() {
        let (server, mut client) = tokio::io::duplex(65536);
        let writer = WsWriter::new(server);

        writer.write_frame(OPCODE_TEXT, b"hello").await.unwrap();
        let mut buf = vec![0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut buf).await.unwrap();
        assert_eq!(buf[0], 0x80 | OPCODE_TEXT);
        assert_eq!(buf[1], 5);
        assert_eq!(&buf[2..], b"hello");

        writer.write_frame(OPCODE_BINARY, &vec![1u8; 300]).await.unwrap();
        let mut header = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut header).await.unwrap();
        assert_eq!(header[0], 0x80 | OPCODE_BINARY);
        assert_eq!(header[1], 126);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 300);
    }
}
