//! Hardware signer abstraction.
//!
//! The production daemon holds its keys in a hardware enclave; this module is
//! the seam. Two independent key slots exist: *routine* signs UserOperation
//! hashes and the persisted configuration, *admin* signs registry and policy
//! extensions. Key handles never leave the signer; callers hand in a 32-byte
//! digest and receive a raw 64-byte `r‖s` signature, always low-S normalized.
//!
//! [`SoftKeystore`] is the file-backed stand-in used on development hosts and
//! in tests. It keeps the same contract: serialized access per slot, low-S
//! output, no DER anywhere.

use alloy_primitives::B256;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::sync::Mutex;

/// Which of the two hardware keys to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    /// Signs UserOperation hashes and the persisted config.
    Routine,
    /// Signs admin actions: registry extension, profile changes.
    Admin,
}

/// A raw 64-byte `r‖s` P-256 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSignature(pub [u8; 64]);

impl RawSignature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Low-S normalization. Idempotent: a signature already in low-S form is
    /// returned unchanged.
    pub fn normalize_low_s(self) -> Result<Self, SignerError> {
        let sig = Signature::from_slice(&self.0)
            .map_err(|e| SignerError::Malformed(e.to_string()))?;
        let sig = sig.normalize_s().unwrap_or(sig);
        let mut out = [0u8; 64];
        out.copy_from_slice(&sig.to_bytes());
        Ok(Self(out))
    }

    /// True when the `s` component is at most half the curve order.
    pub fn is_low_s(&self) -> bool {
        match Signature::from_slice(&self.0) {
            Ok(sig) => sig.normalize_s().is_none(),
            Err(_) => false,
        }
    }
}

/// Uncompressed P-256 public key coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct P256PublicKey {
    pub x: B256,
    pub y: B256,
}

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// The signing backend cannot be reached. Maps to 503; there is no
    /// software fallback for a hardware-configured slot.
    #[error("signer unavailable: {0}")]
    Unavailable(String),
    #[error("malformed signature material: {0}")]
    Malformed(String),
    #[error("key storage: {0}")]
    Storage(#[from] std::io::Error),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Two-key signing capability. One outstanding operation per slot.
#[async_trait::async_trait]
pub trait HardwareSigner: Send + Sync {
    /// Signs a 32-byte digest with the given slot. Output is low-S `r‖s`.
    async fn sign(&self, slot: KeySlot, digest: B256) -> Result<RawSignature, SignerError>;

    /// Uncompressed public key of the slot.
    fn public_key(&self, slot: KeySlot) -> Result<P256PublicKey, SignerError>;

    /// Verifies a raw signature over a digest against the slot's public key.
    fn verify(&self, slot: KeySlot, digest: B256, signature: &RawSignature) -> bool;

    /// Whether the backend is reachable at all.
    fn is_available(&self) -> bool;
}

/// File-backed P-256 keystore standing in for the enclave.
///
/// Keys are raw 32-byte scalars in `routine.key` / `admin.key` under the
/// daemon directory, mode `0600`. Generated on first start if absent.
pub struct SoftKeystore {
    routine: Mutex<SigningKey>,
    routine_vk: VerifyingKey,
    admin: Mutex<SigningKey>,
    admin_vk: VerifyingKey,
}

impl SoftKeystore {
    /// Loads both keys from `dir`, generating and persisting any that are
    /// missing.
    pub fn load_or_generate(dir: &Path) -> Result<Self, SignerError> {
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        let routine = Self::load_key(&dir.join("routine.key"))?;
        let admin = Self::load_key(&dir.join("admin.key"))?;
        let routine_vk = *routine.verifying_key();
        let admin_vk = *admin.verifying_key();
        Ok(Self {
            routine: Mutex::new(routine),
            routine_vk,
            admin: Mutex::new(admin),
            admin_vk,
        })
    }

    /// In-memory keystore with fresh keys. Test seam.
    pub fn ephemeral() -> Self {
        let routine = generate_key();
        let admin = generate_key();
        let routine_vk = *routine.verifying_key();
        let admin_vk = *admin.verifying_key();
        Self {
            routine: Mutex::new(routine),
            routine_vk,
            admin: Mutex::new(admin),
            admin_vk,
        }
    }

    fn load_key(path: &Path) -> Result<SigningKey, SignerError> {
        if path.exists() {
            let bytes = fs::read(path)?;
            SigningKey::from_slice(&bytes).map_err(|e| SignerError::Malformed(e.to_string()))
        } else {
            let key = generate_key();
            fs::write(path, key.to_bytes())?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
            Ok(key)
        }
    }

    fn slot_vk(&self, slot: KeySlot) -> &VerifyingKey {
        match slot {
            KeySlot::Routine => &self.routine_vk,
            KeySlot::Admin => &self.admin_vk,
        }
    }
}

/// Rejection-samples the CSPRNG until the scalar is a valid key;
/// out-of-range draws are vanishingly rare.
fn generate_key() -> SigningKey {
    loop {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        if let Ok(key) = SigningKey::from_slice(&bytes) {
            return key;
        }
    }
}

#[async_trait::async_trait]
impl HardwareSigner for SoftKeystore {
    async fn sign(&self, slot: KeySlot, digest: B256) -> Result<RawSignature, SignerError> {
        let guard = match slot {
            KeySlot::Routine => self.routine.lock().await,
            KeySlot::Admin => self.admin.lock().await,
        };
        let sig: Signature = guard
            .sign_prehash(digest.as_slice())
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        drop(guard);
        let mut out = [0u8; 64];
        out.copy_from_slice(&sig.to_bytes());
        RawSignature(out).normalize_low_s()
    }

    fn public_key(&self, slot: KeySlot) -> Result<P256PublicKey, SignerError> {
        let point = self.slot_vk(slot).to_encoded_point(false);
        let x = point
            .x()
            .ok_or_else(|| SignerError::Malformed("identity point".into()))?;
        let y = point
            .y()
            .ok_or_else(|| SignerError::Malformed("identity point".into()))?;
        Ok(P256PublicKey {
            x: B256::from_slice(x),
            y: B256::from_slice(y),
        })
    }

    fn verify(&self, slot: KeySlot, digest: B256, signature: &RawSignature) -> bool {
        let Ok(sig) = Signature::from_slice(&signature.0) else {
            return false;
        };
        self.slot_vk(slot)
            .verify_prehash(digest.as_slice(), &sig)
            .is_ok()
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    #[tokio::test]
    async fn signs_low_s() {
        let ks = SoftKeystore::ephemeral();
        for i in 0u32..16 {
            let digest = keccak256(i.to_be_bytes());
            let sig = ks.sign(KeySlot::Routine, digest).await.unwrap();
            assert!(sig.is_low_s());
        }
    }

    #[tokio::test]
    async fn normalize_is_idempotent() {
        let ks = SoftKeystore::ephemeral();
        let digest = keccak256(b"idempotent");
        let sig = ks.sign(KeySlot::Routine, digest).await.unwrap();
        let once = sig.normalize_low_s().unwrap();
        let twice = once.normalize_low_s().unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn verify_round_trip() {
        let ks = SoftKeystore::ephemeral();
        let digest = keccak256(b"verify me");
        let sig = ks.sign(KeySlot::Routine, digest).await.unwrap();
        assert!(ks.verify(KeySlot::Routine, digest, &sig));
        assert!(!ks.verify(KeySlot::Admin, digest, &sig));

        let mut tampered = sig;
        tampered.0[10] ^= 0x01;
        assert!(!ks.verify(KeySlot::Routine, digest, &tampered));
    }

    #[tokio::test]
    async fn slots_are_independent() {
        let ks = SoftKeystore::ephemeral();
        let routine = ks.public_key(KeySlot::Routine).unwrap();
        let admin = ks.public_key(KeySlot::Admin).unwrap();
        assert_ne!(routine, admin);
    }

    #[test]
    fn keys_persist_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let a = SoftKeystore::load_or_generate(dir.path()).unwrap();
        let b = SoftKeystore::load_or_generate(dir.path()).unwrap();
        assert_eq!(
            a.public_key(KeySlot::Routine).unwrap(),
            b.public_key(KeySlot::Routine).unwrap()
        );
    }
}
