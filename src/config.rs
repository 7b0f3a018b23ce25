//! Persisted daemon configuration.
//!
//! One [`ConfigStore`] instance exists per process. It exclusively owns the
//! [`DaemonConfig`]; everything else works on snapshot copies. Every mutation
//! is persisted atomically (temp file + rename) and the on-disk bytes are
//! signed by the *routine* hardware key. A load-time signature failure drops
//! the daemon into safe mode: read-only endpoints keep working, every write
//! and signing path refuses until the config is re-signed.

use alloy_primitives::{keccak256, Address};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

use crate::chain::ENTRY_POINT_V07;
use crate::signer::{HardwareSigner, KeySlot, RawSignature, SignerError};

pub const CONFIG_FILE: &str = "config.json";
pub const CONFIG_SIG_FILE: &str = "config.sig";

/// Named canonical limit profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileName {
    Balanced,
    Autonomous,
}

impl FromStr for ProfileName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "balanced" => Ok(Self::Balanced),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(format!("unknown profile `{other}`")),
        }
    }
}

impl std::fmt::Display for ProfileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Balanced => write!(f, "balanced"),
            Self::Autonomous => write!(f, "autonomous"),
        }
    }
}

/// Immutable limit template. Stablecoin caps are 6-decimal base units, ETH
/// caps are wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityProfile {
    pub name: ProfileName,
    pub per_tx_stable_cap: u64,
    pub daily_stable_cap: u64,
    pub per_tx_eth_cap: u64,
    pub daily_eth_cap: u64,
    pub max_tx_per_hour: u32,
    pub min_cooldown_secs: u64,
    pub max_slippage_bps: u32,
}

impl SecurityProfile {
    pub const fn balanced() -> Self {
        Self {
            name: ProfileName::Balanced,
            per_tx_stable_cap: 100_000_000,
            daily_stable_cap: 500_000_000,
            per_tx_eth_cap: 50_000_000_000_000_000,
            daily_eth_cap: 250_000_000_000_000_000,
            max_tx_per_hour: 10,
            min_cooldown_secs: 5,
            max_slippage_bps: 100,
        }
    }

    pub const fn autonomous() -> Self {
        Self {
            name: ProfileName::Autonomous,
            per_tx_stable_cap: 250_000_000,
            daily_stable_cap: 2_000_000_000,
            per_tx_eth_cap: 150_000_000_000_000_000,
            daily_eth_cap: 750_000_000_000_000_000,
            max_tx_per_hour: 30,
            min_cooldown_secs: 2,
            max_slippage_bps: 200,
        }
    }

    pub fn named(name: ProfileName) -> Self {
        match name {
            ProfileName::Balanced => Self::balanced(),
            ProfileName::Autonomous => Self::autonomous(),
        }
    }

    /// Applies per-field overrides on top of this template.
    pub fn with_overrides(mut self, o: &LimitOverrides) -> Self {
        if let Some(v) = o.per_tx_stable_cap {
            self.per_tx_stable_cap = v;
        }
        if let Some(v) = o.daily_stable_cap {
            self.daily_stable_cap = v;
        }
        if let Some(v) = o.per_tx_eth_cap {
            self.per_tx_eth_cap = v;
        }
        if let Some(v) = o.daily_eth_cap {
            self.daily_eth_cap = v;
        }
        if let Some(v) = o.max_tx_per_hour {
            self.max_tx_per_hour = v;
        }
        if let Some(v) = o.min_cooldown_secs {
            self.min_cooldown_secs = v;
        }
        if let Some(v) = o.max_slippage_bps {
            self.max_slippage_bps = v;
        }
        self
    }
}

/// Admin-set overrides shadowing individual profile fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_tx_stable_cap: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_stable_cap: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_tx_eth_cap: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_eth_cap: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tx_per_hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_cooldown_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slippage_bps: Option<u32>,
}

/// The persisted daemon state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub profile: ProfileName,
    pub home_chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_address: Option<Address>,
    pub entry_point: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_address: Option<Address>,
    #[serde(default)]
    pub precompile_available: bool,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundler_url: Option<Url>,
    #[serde(default)]
    pub overrides: LimitOverrides,
    #[serde(default)]
    pub allowlist: BTreeSet<Address>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            profile: ProfileName::Balanced,
            home_chain_id: 8453,
            wallet_address: None,
            factory_address: None,
            entry_point: ENTRY_POINT_V07,
            recovery_address: None,
            precompile_available: false,
            frozen: false,
            bundler_url: None,
            overrides: LimitOverrides::default(),
            allowlist: BTreeSet::new(),
        }
    }
}

impl DaemonConfig {
    /// The limit profile in force: canonical template shadowed by overrides.
    pub fn effective_profile(&self) -> SecurityProfile {
        SecurityProfile::named(self.profile).with_overrides(&self.overrides)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config signing: {0}")]
    Signer(#[from] SignerError),
    #[error("daemon is in safe mode: configuration integrity could not be verified")]
    SafeMode,
}

/// Lock-protected, persisted, integrity-signed configuration store.
pub struct ConfigStore {
    dir: PathBuf,
    state: Mutex<DaemonConfig>,
    signer: Arc<dyn HardwareSigner>,
    safe_mode: AtomicBool,
}

impl ConfigStore {
    /// Loads the store from `dir`, creating a default signed config on first
    /// start. A present-but-unverifiable config enters safe mode instead of
    /// failing the boot.
    pub async fn open(dir: &Path, signer: Arc<dyn HardwareSigner>) -> Result<Self, ConfigError> {
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;

        let config_path = dir.join(CONFIG_FILE);
        let store = if config_path.exists() {
            let bytes = fs::read(&config_path)?;
            let config: DaemonConfig = serde_json::from_slice(&bytes)?;
            let verified = Self::verify_bytes(&*signer, dir, &bytes);
            if !verified {
                tracing::error!(
                    path = %config_path.display(),
                    "config signature verification failed, entering safe mode"
                );
            }
            Self {
                dir: dir.to_path_buf(),
                state: Mutex::new(config),
                signer,
                safe_mode: AtomicBool::new(!verified),
            }
        } else {
            let store = Self {
                dir: dir.to_path_buf(),
                state: Mutex::new(DaemonConfig::default()),
                signer,
                safe_mode: AtomicBool::new(false),
            };
            let snapshot = store.state.lock().await.clone();
            store.persist(&snapshot).await?;
            store
        };
        Ok(store)
    }

    fn verify_bytes(signer: &dyn HardwareSigner, dir: &Path, bytes: &[u8]) -> bool {
        let sig_path = dir.join(CONFIG_SIG_FILE);
        let Ok(sig_bytes) = fs::read(&sig_path) else {
            return false;
        };
        let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
            return false;
        };
        signer.verify(
            KeySlot::Routine,
            keccak256(bytes),
            &RawSignature(sig_array),
        )
    }

    /// Whether the store refuses writes.
    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    /// A point-in-time copy of the configuration.
    pub async fn snapshot(&self) -> DaemonConfig {
        self.state.lock().await.clone()
    }

    /// Applies a mutation, persists, and signs — atomically with respect to
    /// other writers. Refused in safe mode.
    pub async fn update<F>(&self, mutate: F) -> Result<DaemonConfig, ConfigError>
    where
        F: FnOnce(&mut DaemonConfig),
    {
        if self.is_safe_mode() {
            return Err(ConfigError::SafeMode);
        }
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        mutate(&mut next);
        self.persist(&next).await?;
        *guard = next.clone();
        Ok(next)
    }

    /// Writes `config.json` + `config.sig` via temp files and rename. The
    /// signature covers the exact file bytes.
    async fn persist(&self, config: &DaemonConfig) -> Result<(), ConfigError> {
        let bytes = serde_json::to_vec_pretty(config)?;
        let digest = keccak256(&bytes);
        let sig = self.signer.sign(KeySlot::Routine, digest).await?;

        let config_path = self.dir.join(CONFIG_FILE);
        let sig_path = self.dir.join(CONFIG_SIG_FILE);
        let config_tmp = self.dir.join(format!("{CONFIG_FILE}.tmp"));
        let sig_tmp = self.dir.join(format!("{CONFIG_SIG_FILE}.tmp"));

        fs::write(&config_tmp, &bytes)?;
        fs::set_permissions(&config_tmp, fs::Permissions::from_mode(0o600))?;
        fs::write(&sig_tmp, sig.as_bytes())?;
        fs::set_permissions(&sig_tmp, fs::Permissions::from_mode(0o600))?;
        fs::rename(&config_tmp, &config_path)?;
        fs::rename(&sig_tmp, &sig_path)?;
        Ok(())
    }
}
