//! Freeze lifecycle.
//!
//! The local `frozen` flag and the wallet's on-chain `frozen()` view are
//! mirrored one way: on-chain true forces local true; local true never
//! unfreezes anything on-chain. The syncer reads the view at startup and
//! every 60 seconds. RPC errors log and skip — they never flip state. The
//! panic path freezes locally first and pushes the on-chain `freeze()` as a
//! best-effort background operation.

use alloy_primitives::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::daemon::{Daemon, ServiceGraph};

const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic on-chain `frozen()` mirror. Runs until cancelled.
pub async fn run_freeze_syncer(daemon: Arc<Daemon>, cancel: CancellationToken) {
    loop {
        if let Err(e) = sync_once(&daemon.graph()).await {
            tracing::warn!(error = %e, "freeze sync skipped");
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(SYNC_INTERVAL) => {}
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FreezeSyncError {
    #[error("chain: {0}")]
    Chain(#[from] crate::chain::ChainError),
    #[error("config: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// One sync pass. Returns true when it forced a local freeze.
pub async fn sync_once(graph: &ServiceGraph) -> Result<bool, FreezeSyncError> {
    let snapshot = graph.config.snapshot().await;
    let Some(wallet) = snapshot.wallet_address else {
        return Ok(false);
    };
    // Counterfactual wallets have no frozen() to read yet.
    let code = graph.chain.code_at(wallet).await?;
    if code.is_empty() {
        return Ok(false);
    }
    let on_chain_frozen = graph.chain.wallet_frozen(wallet).await?;
    if on_chain_frozen && !snapshot.frozen {
        graph.config.update(|c| c.frozen = true).await?;
        graph
            .audit
            .record(
                "freeze-sync",
                &wallet.to_string(),
                "0",
                "frozen",
                "on-chain frozen flag forced local freeze",
                None,
            )
            .await;
        tracing::warn!(%wallet, "wallet frozen on-chain, forcing local freeze");
        return Ok(true);
    }
    Ok(false)
}

/// Best-effort background submission of the wallet's own `freeze()` after a
/// panic. Failures log; the local freeze already holds.
pub fn spawn_onchain_freeze(graph: Arc<ServiceGraph>) {
    tokio::spawn(async move {
        let snapshot = graph.config.snapshot().await;
        let Some(wallet) = snapshot.wallet_address else {
            tracing::warn!("panic freeze: no wallet configured, nothing to submit");
            return;
        };
        match graph
            .sign_and_submit(
                wallet,
                wallet,
                U256::ZERO,
                ServiceGraph::freeze_calldata(),
                None,
            )
            .await
        {
            Ok(hash) => {
                graph
                    .audit
                    .record(
                        "panic-freeze",
                        &wallet.to_string(),
                        "0",
                        "frozen",
                        "on-chain freeze submitted",
                        Some(&hash.to_string()),
                    )
                    .await;
                tracing::info!(%wallet, %hash, "on-chain freeze submitted");
            }
            Err(e) => {
                tracing::error!(error = %e, "on-chain freeze submission failed");
            }
        }
    });
}
