//! Unix-socket line-protocol server.
//!
//! The daemon listens on a unix domain socket (directory `0700`, socket
//! `0600`) and speaks an HTTP/1.1-shaped one-request-per-connection protocol:
//! request line, headers, optional JSON body, one response, close. It is not
//! a general HTTP server — no keep-alive, no streaming, no routing beyond
//! exact `(method, path)` match.
//!
//! Peer gate: every path except `GET /health` requires the connecting peer's
//! effective UID to equal the daemon's UID, read via `SO_PEERCRED`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::daemon::Daemon;
use crate::handlers::{dispatch, HttpRequest, HttpResponse};

pub const SOCKET_FILE: &str = "daemon.sock";

/// Hard cap on a request, head and body together.
const MAX_REQUEST_BYTES: usize = 64 * 1024;
const READ_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("socket path is a symlink: {0}")]
    SymlinkAtSocketPath(PathBuf),
    #[error("socket I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Validates the socket path and clears a stale socket. Symlinks are
/// rejected outright.
pub fn prepare_socket_path(path: &Path) -> Result<(), ServerError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_symlink() {
                return Err(ServerError::SymlinkAtSocketPath(path.to_path_buf()));
            }
            fs::remove_file(path)?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Binds and serves until cancelled. The socket file is unlinked on exit.
pub async fn run_server(
    socket_path: PathBuf,
    daemon: Arc<Daemon>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    prepare_socket_path(&socket_path)?;
    let listener = UnixListener::bind(&socket_path)?;
    fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;
    tracing::info!(path = %socket_path.display(), "listening");

    let daemon_uid = unsafe { libc::getuid() };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let daemon = daemon.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, daemon, daemon_uid).await;
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
    if let Err(e) = fs::remove_file(&socket_path) {
        tracing::warn!(error = %e, "failed to unlink socket on shutdown");
    }
    Ok(())
}

async fn handle_connection(mut stream: UnixStream, daemon: Arc<Daemon>, daemon_uid: u32) {
    let response = match read_request(&mut stream).await {
        Ok(request) => {
            let authorized = stream
                .peer_cred()
                .map(|cred| cred.uid() == daemon_uid)
                .unwrap_or(false);
            if !(request.method == "GET" && request.path == "/health") && !authorized {
                HttpResponse::refusal(403, "peer not authorized")
            } else {
                dispatch(&daemon, request).await
            }
        }
        Err(reason) => HttpResponse::refusal(400, reason),
    };
    // The client may already be gone; a failed write is not an error worth
    // surfacing.
    let _ = write_response(&mut stream, &response).await;
    let _ = stream.shutdown().await;
}

async fn read_request(stream: &mut UnixStream) -> Result<HttpRequest, String> {
    let raw = tokio::time::timeout(READ_DEADLINE, read_raw(stream))
        .await
        .map_err(|_| "request read timed out".to_string())??;
    parse_request(&raw)
}

async fn read_raw(stream: &mut UnixStream) -> Result<Vec<u8>, String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        // Head first: stop growing once the blank line shows up and the
        // advertised body is complete.
        if let Some(head_end) = find_head_end(&buffer) {
            let content_length = parse_content_length(&buffer[..head_end])?;
            if buffer.len() >= head_end + content_length {
                return Ok(buffer);
            }
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err("request too large".to_string());
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| format!("socket read: {e}"))?;
        if n == 0 {
            return if buffer.is_empty() {
                Err("empty request".to_string())
            } else if find_head_end(&buffer).is_some() {
                Ok(buffer)
            } else {
                Err("truncated request".to_string())
            };
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
}

fn parse_content_length(head: &[u8]) -> Result<usize, String> {
    let head = std::str::from_utf8(head).map_err(|_| "head is not UTF-8".to_string())?;
    for line in head.lines().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| "invalid content-length".to_string());
            }
        }
    }
    Ok(0)
}

/// Parses a full request: request line, headers, optional JSON body.
pub fn parse_request(raw: &[u8]) -> Result<HttpRequest, String> {
    let head_end = find_head_end(raw).ok_or_else(|| "missing header terminator".to_string())?;
    let head =
        std::str::from_utf8(&raw[..head_end]).map_err(|_| "head is not UTF-8".to_string())?;
    let request_line = head.lines().next().ok_or_else(|| "empty request".to_string())?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| "missing method".to_string())?;
    let path = parts.next().ok_or_else(|| "missing path".to_string())?;
    match method {
        "GET" | "POST" => {}
        other => return Err(format!("unsupported method {other}")),
    }

    let content_length = parse_content_length(&raw[..head_end])?;
    let body = if content_length > 0 {
        let body_bytes = raw
            .get(head_end..head_end + content_length)
            .ok_or_else(|| "body shorter than content-length".to_string())?;
        Some(
            serde_json::from_slice(body_bytes)
                .map_err(|e| format!("body is not valid JSON: {e}"))?,
        )
    } else {
        None
    };

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        body,
    })
}

async fn write_response(
    stream: &mut UnixStream,
    response: &HttpResponse,
) -> std::io::Result<()> {
    let body = response.body.to_string();
    let head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        response.status,
        reason_phrase(response.status),
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_without_body() {
        let raw = b"GET /health HTTP/1.1\r\nhost: localhost\r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/health");
        assert!(request.body.is_none());
    }

    #[test]
    fn parses_post_with_json_body() {
        let body = r#"{"target":"0x00","value":"1"}"#;
        let raw = format!(
            "POST /sign HTTP/1.1\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let request = parse_request(raw.as_bytes()).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/sign");
        assert_eq!(request.body.unwrap()["value"], "1");
    }

    #[test]
    fn rejects_non_json_body() {
        let raw = b"POST /sign HTTP/1.1\r\ncontent-length: 3\r\n\r\nxyz";
        assert!(parse_request(raw).unwrap_err().contains("JSON"));
    }

    #[test]
    fn rejects_unsupported_method() {
        let raw = b"DELETE /sign HTTP/1.1\r\n\r\n";
        assert!(parse_request(raw).unwrap_err().contains("unsupported"));
    }

    #[test]
    fn rejects_truncated_body() {
        let raw = b"POST /sign HTTP/1.1\r\ncontent-length: 10\r\n\r\n{}";
        assert!(parse_request(raw).is_err());
    }

    #[test]
    fn prepare_rejects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join(SOCKET_FILE);
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let err = prepare_socket_path(&link).unwrap_err();
        assert!(matches!(err, ServerError::SymlinkAtSocketPath(_)));
    }

    #[test]
    fn prepare_removes_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_FILE);
        std::fs::write(&path, b"stale").unwrap();
        prepare_socket_path(&path).unwrap();
        assert!(!path.exists());
    }
}
