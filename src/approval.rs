//! Human approval codes.
//!
//! When policy requires a human, the daemon mints an 8-digit code bound to
//! the exact intent via a keccak hash of its fields. The binding hash covers
//! chain id, wallet, target, value, and the calldata hash; the 180 s TTL
//! bounds replay. Codes are single-use and never appear in logs or responses;
//! only an 18-character prefix of the binding hash surfaces, for the user
//! notification.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::SolValue;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// Code lifetime.
pub const APPROVAL_TTL_SECS: u64 = 180;
/// Per-entry failed verification budget.
const MAX_FAILED_ATTEMPTS: u32 = 3;
/// Global failed-verification budget per rolling minute.
const MAX_GLOBAL_FAILURES_PER_MINUTE: usize = 5;

/// Binds a human approval to one intent. Never signed or sent on-chain.
pub fn compute_approval_hash(
    chain_id: u64,
    wallet: Address,
    target: Address,
    value: u64,
    calldata: &Bytes,
) -> B256 {
    keccak256(
        (
            U256::from(chain_id),
            wallet,
            target,
            U256::from(value),
            keccak256(calldata),
            U256::ZERO,
        )
            .abi_encode(),
    )
}

/// `0x` plus the first 16 hex characters of the binding hash.
pub fn hash_prefix(hash: &B256) -> String {
    let full = hash.to_string();
    full[..18].to_string()
}

#[derive(Debug, Clone)]
struct PendingApproval {
    approval_hash: B256,
    summary: String,
    #[allow(dead_code)]
    created_at: u64,
    expires_at: u64,
    failed_attempts: u32,
}

/// What a verification attempt resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Approved,
    /// Unknown code, or a code bound to a different intent.
    Invalid,
    Expired,
    /// Too many failed attempts against this entry.
    Revoked,
    /// Too many failed verifications process-wide.
    RateLimited,
}

/// Informational view for the companion UI.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub summary: String,
    pub hash_prefix: String,
    pub expires_in: u64,
}

/// A freshly minted approval. The code leaves the process only through the
/// human-presence oracle.
#[derive(Debug, Clone)]
pub struct CreatedApproval {
    pub code: String,
    pub hash_prefix: String,
    pub summary: String,
    pub expires_in: u64,
}

#[derive(Default)]
struct ApprovalState {
    by_code: HashMap<String, PendingApproval>,
    failures: VecDeque<u64>,
}

impl ApprovalState {
    fn purge_expired(&mut self, now: u64) {
        self.by_code.retain(|_, entry| now < entry.expires_at);
    }

    fn prune_failures(&mut self, now: u64) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_sub(oldest) >= 60 {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn record_failure(&mut self, now: u64) {
        self.failures.push_back(now);
    }

    fn rate_limited(&mut self, now: u64) -> bool {
        self.prune_failures(now);
        self.failures.len() >= MAX_GLOBAL_FAILURES_PER_MINUTE
    }
}

/// Exclusive owner of the pending-approval table.
pub struct ApprovalManager {
    state: Mutex<ApprovalState>,
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ApprovalState::default()),
        }
    }

    /// Mints a code for an intent the policy engine gated.
    pub async fn create(
        &self,
        approval_hash: B256,
        summary: String,
        now: u64,
    ) -> CreatedApproval {
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        let mut code = random_code();
        while state.by_code.contains_key(&code) {
            code = random_code();
        }
        state.by_code.insert(
            code.clone(),
            PendingApproval {
                approval_hash,
                summary: summary.clone(),
                created_at: now,
                expires_at: now + APPROVAL_TTL_SECS,
                failed_attempts: 0,
            },
        );
        CreatedApproval {
            code,
            hash_prefix: hash_prefix(&approval_hash),
            summary,
            expires_in: APPROVAL_TTL_SECS,
        }
    }

    /// Verifies a code against the hash of the *current* intent.
    pub async fn verify(&self, code: &str, current_hash: B256, now: u64) -> VerifyOutcome {
        let mut state = self.state.lock().await;

        if state.rate_limited(now) {
            return VerifyOutcome::RateLimited;
        }

        let Some(entry) = state.by_code.get_mut(code) else {
            state.record_failure(now);
            return VerifyOutcome::Invalid;
        };

        if entry.failed_attempts >= MAX_FAILED_ATTEMPTS {
            state.by_code.remove(code);
            return VerifyOutcome::Revoked;
        }
        if now >= entry.expires_at {
            state.by_code.remove(code);
            return VerifyOutcome::Expired;
        }
        if entry.approval_hash != current_hash {
            entry.failed_attempts += 1;
            state.record_failure(now);
            return VerifyOutcome::Invalid;
        }

        state.by_code.remove(code);
        VerifyOutcome::Approved
    }

    pub async fn list_pending(&self, now: u64) -> Vec<PendingSummary> {
        let mut state = self.state.lock().await;
        state.purge_expired(now);
        state
            .by_code
            .values()
            .map(|entry| PendingSummary {
                summary: entry.summary.clone(),
                hash_prefix: hash_prefix(&entry.approval_hash),
                expires_in: entry.expires_at.saturating_sub(now),
            })
            .collect()
    }
}

impl Default for ApprovalManager {
    fn default() -> Self {
        Self::new()
    }
}

fn random_code() -> String {
    let n: u32 = rand::rng().random();
    format!("{:08}", n % 100_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const NOW: u64 = 1_750_000_000;

    fn hash_a() -> B256 {
        compute_approval_hash(
            8453,
            address!("0x0000000000000000000000000000000000001111"),
            address!("0x0000000000000000000000000000000000002222"),
            60_000_000_000_000_000,
            &Bytes::new(),
        )
    }

    fn hash_b() -> B256 {
        compute_approval_hash(
            8453,
            address!("0x0000000000000000000000000000000000001111"),
            address!("0x0000000000000000000000000000000000003333"),
            60_000_000_000_000_000,
            &Bytes::new(),
        )
    }

    #[test]
    fn binding_hash_covers_intent_fields() {
        assert_ne!(hash_a(), hash_b());
        assert_eq!(hash_a(), hash_a());
    }

    #[test]
    fn prefix_is_eighteen_chars() {
        let p = hash_prefix(&hash_a());
        assert_eq!(p.len(), 18);
        assert!(p.starts_with("0x"));
    }

    #[tokio::test]
    async fn round_trip_and_single_use() {
        let mgr = ApprovalManager::new();
        let created = mgr.create(hash_a(), "Transfer 0.0600 ETH".into(), NOW).await;
        assert_eq!(created.code.len(), 8);
        assert!(created.code.chars().all(|c| c.is_ascii_digit()));

        let outcome = mgr.verify(&created.code, hash_a(), NOW + 10).await;
        assert_eq!(outcome, VerifyOutcome::Approved);

        // Spent: the same code can never approve again.
        let outcome = mgr.verify(&created.code, hash_a(), NOW + 11).await;
        assert_eq!(outcome, VerifyOutcome::Invalid);
    }

    #[tokio::test]
    async fn mismatched_intent_is_invalid() {
        let mgr = ApprovalManager::new();
        let created = mgr.create(hash_a(), "x".into(), NOW).await;
        let outcome = mgr.verify(&created.code, hash_b(), NOW + 1).await;
        assert_eq!(outcome, VerifyOutcome::Invalid);
        // The entry survives a mismatch and still approves the bound intent.
        let outcome = mgr.verify(&created.code, hash_a(), NOW + 2).await;
        assert_eq!(outcome, VerifyOutcome::Approved);
    }

    #[tokio::test]
    async fn expiry_removes_entry() {
        let mgr = ApprovalManager::new();
        let created = mgr.create(hash_a(), "x".into(), NOW).await;
        let outcome = mgr
            .verify(&created.code, hash_a(), NOW + APPROVAL_TTL_SECS)
            .await;
        assert_eq!(outcome, VerifyOutcome::Expired);
        assert!(mgr.list_pending(NOW + APPROVAL_TTL_SECS).await.is_empty());
    }

    #[tokio::test]
    async fn three_failures_revoke() {
        let mgr = ApprovalManager::new();
        let created = mgr.create(hash_a(), "x".into(), NOW).await;
        for i in 0..3 {
            assert_eq!(
                mgr.verify(&created.code, hash_b(), NOW + i).await,
                VerifyOutcome::Invalid
            );
        }
        assert_eq!(
            mgr.verify(&created.code, hash_a(), NOW + 4).await,
            VerifyOutcome::Revoked
        );
        // Revocation removed the entry.
        assert_eq!(
            mgr.verify(&created.code, hash_a(), NOW + 5).await,
            VerifyOutcome::Invalid
        );
    }

    #[tokio::test]
    async fn global_rate_limit_kicks_in() {
        let mgr = ApprovalManager::new();
        for i in 0..5 {
            assert_eq!(
                mgr.verify("00000000", hash_a(), NOW + i).await,
                VerifyOutcome::Invalid
            );
        }
        assert_eq!(
            mgr.verify("00000000", hash_a(), NOW + 6).await,
            VerifyOutcome::RateLimited
        );
        // The window slides: a minute later verification resumes.
        assert_eq!(
            mgr.verify("00000000", hash_a(), NOW + 70).await,
            VerifyOutcome::Invalid
        );
    }

    #[tokio::test]
    async fn pending_list_exposes_prefix_not_code() {
        let mgr = ApprovalManager::new();
        let created = mgr.create(hash_a(), "summary".into(), NOW).await;
        let pending = mgr.list_pending(NOW + 1).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hash_prefix, hash_prefix(&hash_a()));
        assert_eq!(pending[0].expires_in, APPROVAL_TTL_SECS - 1);
        let as_json = serde_json::to_string(&pending).unwrap();
        assert!(!as_json.contains(&created.code));
    }
}
