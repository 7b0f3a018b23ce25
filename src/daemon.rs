//! Daemon assembly: the service graph and its atomic rebuild.
//!
//! A [`ServiceGraph`] is everything a request handler needs, built for one
//! `(chain, profile)` pair. Durable state — config store, signer, audit log,
//! approval table, spending ledger, stablecoin registry — lives on the
//! [`Daemon`] and is shared into every graph; chain-dependent pieces (chain
//! client, bundler, policy engine, userop builder) are rebuilt on
//! reconfiguration and published with a single [`ArcSwap`] store, so no
//! request ever observes a torn graph.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use arc_swap::ArcSwap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::approval::ApprovalManager;
use crate::audit::AuditLog;
use crate::bundler::{BundlerError, BundlerRpc, HttpBundler};
use crate::chain::{AlloyChain, ChainError, ChainRpc, IWardWallet, P256_VERIFY_PRECOMPILE};
use crate::config::{ConfigError, ConfigStore, DaemonConfig};
use crate::oracle::PresenceOracle;
use crate::policy::PolicyEngine;
use crate::registry::{ProtocolRegistry, StablecoinRegistry};
use crate::signer::{HardwareSigner, KeySlot, SignerError};
use crate::spending::SpendingTracker;
use crate::userop::{
    preflight_gas, BuildError, GasShortfall, UserOpBuilder, UserOpHashScheme,
};
use crate::util::now_secs;

/// Process-wide sign-endpoint budget: 30 requests per sliding minute.
const SIGN_RATE_LIMIT: usize = 30;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("daemon I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures on the allow path of a sign request, in pipeline order.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("building operation: {0}")]
    Build(#[from] BuildError),
    #[error(transparent)]
    Gas(#[from] GasShortfall),
    #[error("reading balance: {0}")]
    Balance(#[from] ChainError),
    #[error("signing: {0}")]
    Signer(#[from] SignerError),
    #[error("submitting: {0}")]
    Submit(#[from] BundlerError),
}

/// Builds the chain-facing clients for a configuration. The production
/// connector dials real endpoints; tests inject fakes.
pub type Connector = Box<
    dyn Fn(&DaemonConfig) -> Result<(Arc<dyn ChainRpc>, Arc<dyn BundlerRpc>), DaemonError>
        + Send
        + Sync,
>;

/// One coherent set of services for the configured chain and profile.
pub struct ServiceGraph {
    pub config: Arc<ConfigStore>,
    pub signer: Arc<dyn HardwareSigner>,
    pub audit: Arc<AuditLog>,
    pub approvals: Arc<ApprovalManager>,
    pub oracle: Arc<dyn PresenceOracle>,
    pub stablecoins: Arc<Mutex<StablecoinRegistry>>,
    pub chain: Arc<dyn ChainRpc>,
    pub bundler: Arc<dyn BundlerRpc>,
    pub policy: PolicyEngine,
    pub builder: UserOpBuilder,
    pub chain_id: u64,
}

impl ServiceGraph {
    /// Signs and submits one operation: build, gas preflight, sign, send.
    /// Returns the userOpHash the wallet validated against.
    pub async fn sign_and_submit(
        &self,
        sender: Address,
        target: Address,
        value: U256,
        calldata: Bytes,
        init_code: Option<Bytes>,
    ) -> Result<B256, PipelineError> {
        let (mut op, hash) = self
            .builder
            .build(sender, target, value, calldata, init_code)
            .await?;

        let balance = self.chain.balance(sender).await?;
        preflight_gas(&op, balance)?;

        let signature = self.signer.sign(KeySlot::Routine, hash).await?;
        op.signature = Bytes::from(signature.as_bytes().to_vec());

        self.bundler
            .send_user_operation(&op, self.builder.entry_point())
            .await?;
        Ok(hash)
    }

    /// A draft freeze operation for the background panic path: the wallet
    /// calls its own `freeze()` through `execute`.
    pub fn freeze_calldata() -> Bytes {
        Bytes::from(IWardWallet::freezeCall {}.abi_encode())
    }
}

/// Root of the daemon. Owns durable state and the swappable graph.
pub struct Daemon {
    graph: ArcSwap<ServiceGraph>,
    config: Arc<ConfigStore>,
    signer: Arc<dyn HardwareSigner>,
    audit: Arc<AuditLog>,
    approvals: Arc<ApprovalManager>,
    oracle: Arc<dyn PresenceOracle>,
    stablecoins: Arc<Mutex<StablecoinRegistry>>,
    spending: Arc<Mutex<SpendingTracker>>,
    connector: Connector,
    sign_window: Mutex<VecDeque<u64>>,
    pub data_dir: PathBuf,
    pub started_at: u64,
}

impl Daemon {
    /// Production wiring: alloy chain client plus HTTPS bundler, per the
    /// static chain table and any configured bundler override.
    pub fn production_connector() -> Connector {
        Box::new(|config: &DaemonConfig| {
            let chain = AlloyChain::connect(config.home_chain_id, None)?;
            let bundler_url = match &config.bundler_url {
                Some(url) => url.clone(),
                None => crate::chain::chain_target(config.home_chain_id)
                    .ok_or(ChainError::UnsupportedChain(config.home_chain_id))?
                    .bundler_url
                    .parse()
                    .map_err(|e| ChainError::InvalidUrl(format!("{e}")))?,
            };
            Ok((
                Arc::new(chain) as Arc<dyn ChainRpc>,
                Arc::new(HttpBundler::new(bundler_url)) as Arc<dyn BundlerRpc>,
            ))
        })
    }

    /// Assembles the daemon and its first service graph.
    pub async fn bootstrap(
        data_dir: &Path,
        signer: Arc<dyn HardwareSigner>,
        oracle: Arc<dyn PresenceOracle>,
        connector: Connector,
    ) -> Result<Arc<Self>, DaemonError> {
        let config = Arc::new(ConfigStore::open(data_dir, signer.clone()).await?);
        let audit = Arc::new(AuditLog::new(data_dir));
        let approvals = Arc::new(ApprovalManager::new());
        let stablecoins = Arc::new(Mutex::new(StablecoinRegistry::bootstrap()));
        let spending = Arc::new(Mutex::new(SpendingTracker::new(now_secs())));

        let snapshot = config.snapshot().await;
        let (chain, bundler) = connector(&snapshot)?;
        let graph = build_graph(
            &snapshot,
            config.clone(),
            signer.clone(),
            audit.clone(),
            approvals.clone(),
            oracle.clone(),
            stablecoins.clone(),
            spending.clone(),
            chain,
            bundler,
        );

        Ok(Arc::new(Self {
            graph: ArcSwap::from_pointee(graph),
            config,
            signer,
            audit,
            approvals,
            oracle,
            stablecoins,
            spending,
            connector,
            sign_window: Mutex::new(VecDeque::new()),
            data_dir: data_dir.to_path_buf(),
            started_at: now_secs(),
        }))
    }

    /// The current graph. Handlers load this once per request so the whole
    /// request sees one consistent set of services.
    pub fn graph(&self) -> Arc<ServiceGraph> {
        self.graph.load_full()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Rebuilds the chain-dependent services from the current configuration
    /// and publishes the new graph in one pointer swap.
    pub async fn reconfigure(&self) -> Result<(), DaemonError> {
        let snapshot = self.config.snapshot().await;
        let (chain, bundler) = (self.connector)(&snapshot)?;
        let graph = build_graph(
            &snapshot,
            self.config.clone(),
            self.signer.clone(),
            self.audit.clone(),
            self.approvals.clone(),
            self.oracle.clone(),
            self.stablecoins.clone(),
            self.spending.clone(),
            chain,
            bundler,
        );
        self.graph.store(Arc::new(graph));
        tracing::info!(
            chain_id = snapshot.home_chain_id,
            profile = %snapshot.profile,
            "service graph rebuilt"
        );
        Ok(())
    }

    /// Sliding-window admission for `/sign`. True when the request may run.
    pub async fn admit_sign_request(&self, now: u64) -> bool {
        let mut window = self.sign_window.lock().await;
        while let Some(&oldest) = window.front() {
            if now.saturating_sub(oldest) >= 60 {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= SIGN_RATE_LIMIT {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Probes the RIP-7212 P-256 precompile with three self-produced vectors
    /// and caches the verdict in configuration.
    pub async fn probe_precompile(&self) -> Result<bool, DaemonError> {
        let graph = self.graph();
        let digest = keccak256(b"p256 precompile probe");
        let signature = self.signer.sign(KeySlot::Routine, digest).await?;
        let public_key = self.signer.public_key(KeySlot::Routine)?;

        let mut valid = Vec::with_capacity(160);
        valid.extend_from_slice(digest.as_slice());
        valid.extend_from_slice(signature.as_bytes());
        valid.extend_from_slice(public_key.x.as_slice());
        valid.extend_from_slice(public_key.y.as_slice());

        let mut invalid = valid.clone();
        invalid[40] ^= 0x01; // corrupt r

        let malformed = valid[..10].to_vec();

        let available = verifies(&graph, valid).await
            && !verifies(&graph, invalid).await
            && !verifies(&graph, malformed).await;

        if !self.config.is_safe_mode() {
            self.config
                .update(|c| c.precompile_available = available)
                .await?;
        }
        tracing::info!(available, "p256 precompile probe complete");
        Ok(available)
    }
}

async fn verifies(graph: &ServiceGraph, input: Vec<u8>) -> bool {
    match graph
        .chain
        .call_raw(P256_VERIFY_PRECOMPILE, Bytes::from(input))
        .await
    {
        Ok(output) => output.len() == 32 && output[31] == 1 && output[..31].iter().all(|b| *b == 0),
        Err(_) => false,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_graph(
    snapshot: &DaemonConfig,
    config: Arc<ConfigStore>,
    signer: Arc<dyn HardwareSigner>,
    audit: Arc<AuditLog>,
    approvals: Arc<ApprovalManager>,
    oracle: Arc<dyn PresenceOracle>,
    stablecoins: Arc<Mutex<StablecoinRegistry>>,
    spending: Arc<Mutex<SpendingTracker>>,
    chain: Arc<dyn ChainRpc>,
    bundler: Arc<dyn BundlerRpc>,
) -> ServiceGraph {
    let protocols = ProtocolRegistry::for_profile(snapshot.profile);
    let policy = PolicyEngine::new(chain.clone(), protocols, spending);
    let builder = UserOpBuilder::new(
        chain.clone(),
        bundler.clone(),
        snapshot.entry_point,
        UserOpHashScheme::EntryPointV07,
    );
    ServiceGraph {
        config,
        signer,
        audit,
        approvals,
        oracle,
        stablecoins,
        chain_id: chain.chain_id(),
        chain,
        bundler,
        policy,
        builder,
    }
}

/// Boot-time signer sanity check: a routine key that cannot produce a
/// verifiable signature means the hardware backend is wedged; surface it at
/// boot instead of on the first sign request.
pub async fn verify_signer_health(signer: &dyn HardwareSigner) -> Result<(), SignerError> {
    if !signer.is_available() {
        return Err(SignerError::Unavailable("signer reports unavailable".into()));
    }
    let digest = keccak256(b"signer health check");
    let signature = signer.sign(KeySlot::Routine, digest).await?;
    if !signer.verify(KeySlot::Routine, digest, &signature) {
        return Err(SignerError::Signing(
            "routine key produced an unverifiable signature".into(),
        ));
    }
    Ok(())
}
