//! Human-presence oracle client.
//!
//! Admin actions (policy changes, allowlist edits, unfreeze) need a trusted
//! confirmation of the *exact change* plus biometric proof of presence. Both
//! come from the companion UI, a separate trusted surface the daemon cannot
//! forge; the daemon only sees the verdict. The UI listens on its own unix
//! socket and speaks one JSON line per request. Unreachable or timed-out
//! means admin operations fail closed.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::approval::PendingSummary;

/// Hard deadline on any oracle round trip.
pub const ORACLE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("presence oracle unreachable: {0}")]
    Unreachable(String),
    #[error("presence oracle timed out")]
    Timeout,
    #[error("presence oracle protocol: {0}")]
    Protocol(String),
}

/// The trusted confirm-and-biometric surface.
#[async_trait::async_trait]
pub trait PresenceOracle: Send + Sync {
    /// Shows an OS-native dialog describing `summary` (daemon-authored, never
    /// agent-authored) behind a biometric gate. `Ok(true)` means the human
    /// approved exactly that change.
    async fn request_admin_approval(&self, summary: &str) -> Result<bool, OracleError>;

    /// User-visible record of a freshly minted approval code.
    async fn post_approval_notification(
        &self,
        code: &str,
        summary: &str,
        hash_prefix: &str,
        expires_in: u64,
    ) -> Result<bool, OracleError>;

    /// Purely informational mirror of pending notifications.
    async fn list_pending(&self) -> Result<Vec<PendingSummary>, OracleError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OracleRequest<'a> {
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OracleResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    pending: Vec<PendingSummaryWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingSummaryWire {
    summary: String,
    hash_prefix: String,
    expires_in: u64,
}

/// [`PresenceOracle`] over the companion UI's unix socket.
pub struct UiSocketOracle {
    socket_path: PathBuf,
    deadline: Duration,
}

impl UiSocketOracle {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            deadline: ORACLE_DEADLINE,
        }
    }

    #[cfg(test)]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    async fn round_trip(&self, request: OracleRequest<'_>) -> Result<OracleResponse, OracleError> {
        let exchange = async {
            let stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| OracleError::Unreachable(e.to_string()))?;
            let (read_half, mut write_half) = stream.into_split();

            let mut line = serde_json::to_vec(&request)
                .map_err(|e| OracleError::Protocol(e.to_string()))?;
            line.push(b'\n');
            write_half
                .write_all(&line)
                .await
                .map_err(|e| OracleError::Unreachable(e.to_string()))?;

            let mut reader = BufReader::new(read_half);
            let mut response_line = String::new();
            reader
                .read_line(&mut response_line)
                .await
                .map_err(|e| OracleError::Unreachable(e.to_string()))?;
            serde_json::from_str::<OracleResponse>(&response_line)
                .map_err(|e| OracleError::Protocol(e.to_string()))
        };
        tokio::time::timeout(self.deadline, exchange)
            .await
            .map_err(|_| OracleError::Timeout)?
    }
}

#[async_trait::async_trait]
impl PresenceOracle for UiSocketOracle {
    async fn request_admin_approval(&self, summary: &str) -> Result<bool, OracleError> {
        let response = self
            .round_trip(OracleRequest {
                method: "requestAdminApproval",
                params: json!({ "summary": summary }),
            })
            .await?;
        Ok(response.ok)
    }

    async fn post_approval_notification(
        &self,
        code: &str,
        summary: &str,
        hash_prefix: &str,
        expires_in: u64,
    ) -> Result<bool, OracleError> {
        let response = self
            .round_trip(OracleRequest {
                method: "postApprovalNotification",
                params: json!({
                    "code": code,
                    "summary": summary,
                    "hashPrefix": hash_prefix,
                    "expiresIn": expires_in,
                }),
            })
            .await?;
        Ok(response.ok)
    }

    async fn list_pending(&self) -> Result<Vec<PendingSummary>, OracleError> {
        let response = self
            .round_trip(OracleRequest {
                method: "listPending",
                params: json!({}),
            })
            .await?;
        Ok(response
            .pending
            .into_iter()
            .map(|p| PendingSummary {
                summary: p.summary,
                hash_prefix: p.hash_prefix,
                expires_in: p.expires_in,
            })
            .collect())
    }
}

/// Stand-in when no companion UI is configured. Everything fails closed.
pub struct NullOracle;

#[async_trait::async_trait]
impl PresenceOracle for NullOracle {
    async fn request_admin_approval(&self, _summary: &str) -> Result<bool, OracleError> {
        Err(OracleError::Unreachable("no companion UI configured".into()))
    }

    async fn post_approval_notification(
        &self,
        _code: &str,
        _summary: &str,
        _hash_prefix: &str,
        _expires_in: u64,
    ) -> Result<bool, OracleError> {
        Err(OracleError::Unreachable("no companion UI configured".into()))
    }

    async fn list_pending(&self) -> Result<Vec<PendingSummary>, OracleError> {
        Err(OracleError::Unreachable("no companion UI configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    async fn spawn_ui(dir: &std::path::Path, reply: &'static str, delay: Duration) -> PathBuf {
        let path = dir.join("ui.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    let mut line = String::new();
                    let _ = reader.read_line(&mut line).await;
                    tokio::time::sleep(delay).await;
                    let _ = write_half.write_all(reply.as_bytes()).await;
                });
            }
        });
        path
    }

    #[tokio::test]
    async fn approval_verdicts_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = spawn_ui(dir.path(), "{\"ok\":true}\n", Duration::ZERO).await;
        let oracle = UiSocketOracle::new(path);
        assert!(oracle.request_admin_approval("switch profile").await.unwrap());
    }

    #[tokio::test]
    async fn denial_is_ok_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = spawn_ui(dir.path(), "{\"ok\":false}\n", Duration::ZERO).await;
        let oracle = UiSocketOracle::new(path);
        assert!(!oracle.request_admin_approval("drain wallet").await.unwrap());
    }

    #[tokio::test]
    async fn missing_socket_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = UiSocketOracle::new(dir.path().join("absent.sock"));
        let err = oracle.request_admin_approval("x").await.unwrap_err();
        assert!(matches!(err, OracleError::Unreachable(_)));
    }

    #[tokio::test]
    async fn slow_ui_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = spawn_ui(dir.path(), "{\"ok\":true}\n", Duration::from_millis(100)).await;
        let oracle = UiSocketOracle::new(path).with_deadline(Duration::from_millis(10));
        let err = oracle.request_admin_approval("x").await.unwrap_err();
        assert!(matches!(err, OracleError::Timeout));
    }

    #[tokio::test]
    async fn null_oracle_fails_closed() {
        let err = NullOracle.request_admin_approval("x").await.unwrap_err();
        assert!(matches!(err, OracleError::Unreachable(_)));
    }
}
