//! Append-only audit trail.
//!
//! Every decision the daemon takes lands here as one JSON line: timestamp,
//! action, shortened target, value, decision verb, reason, transaction hash.
//! String fields pass through the redactor so approval codes can never reach
//! disk. The in-memory window holds the last 1000 entries for `/audit-log`;
//! the file keeps everything.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::util::{now_secs, redact, shorten};

const WINDOW: usize = 1000;
pub const AUDIT_FILE: &str = "audit.log";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: u64,
    pub action: String,
    pub target: String,
    pub value: String,
    pub decision: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

pub struct AuditLog {
    path: PathBuf,
    ring: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(AUDIT_FILE),
            ring: Mutex::new(VecDeque::with_capacity(WINDOW)),
        }
    }

    /// Records one decision. Redaction and target shortening happen here so
    /// callers cannot forget them.
    pub async fn record(
        &self,
        action: &str,
        target: &str,
        value: &str,
        decision: &str,
        reason: &str,
        tx_hash: Option<&str>,
    ) {
        let entry = AuditEntry {
            timestamp: now_secs(),
            action: redact(action),
            target: shorten(&redact(target)),
            value: redact(value),
            decision: redact(decision),
            reason: redact(reason),
            tx_hash: tx_hash.map(|h| redact(h)),
        };

        let mut ring = self.ring.lock().await;
        if ring.len() == WINDOW {
            ring.pop_front();
        }
        ring.push_back(entry.clone());
        drop(ring);

        if let Err(e) = self.append_line(&entry).await {
            tracing::error!(error = %e, "failed to append audit entry");
        }
    }

    async fn append_line(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }

    /// The bounded in-memory window, oldest first.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.ring.lock().await.iter().cloned().collect()
    }
}
