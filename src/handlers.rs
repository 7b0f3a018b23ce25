//! Endpoint handlers.
//!
//! The socket server parses a request and hands it here; dispatch is an
//! exact match on `(method, path)`. Every refusal carries a one-sentence
//! `reason`, and the decision verbs — `allow`, `approval_required`,
//! `denied`, `frozen` — are the same in responses and in the audit trail.

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::SolCall;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use tracing::instrument;
use url::Url;

use crate::approval::{compute_approval_hash, VerifyOutcome};
use crate::config::ProfileName;
use crate::daemon::{Daemon, PipelineError, ServiceGraph};
use crate::decode::{decode, CallAction, DecodedCall};
use crate::freeze;
use crate::intent::{Intent, IntentEnvelope};
use crate::policy::{Decision, DenyReason};
use crate::signer::{KeySlot, SignerError};
use crate::util::now_secs;

/// A parsed socket request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
}

/// What the socket server writes back.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn with_status(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn refusal(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "reason": reason.into() }),
        }
    }
}

/// Routes a request. The peer-UID gate already ran in the server.
pub async fn dispatch(daemon: &Daemon, request: HttpRequest) -> HttpResponse {
    let method = request.method.as_str();
    let path = request.path.as_str();

    // In safe mode only read-only endpoints are served.
    if daemon.config().is_safe_mode() && method == "POST" {
        return HttpResponse::refusal(
            403,
            "safe mode: configuration integrity could not be verified, writes are disabled",
        );
    }

    match (method, path) {
        ("GET", "/health") => get_health(daemon).await,
        ("GET", "/address") => get_address(daemon).await,
        ("GET", "/capabilities") => get_capabilities(daemon).await,
        ("GET", "/policy") => get_policy(daemon).await,
        ("GET", "/audit-log") => get_audit_log(daemon).await,
        ("POST", "/decode") => post_decode(daemon, request.body).await,
        ("POST", "/sign") => post_sign(daemon, request.body).await,
        ("POST", "/panic") => post_panic(daemon).await,
        ("POST", "/unfreeze") => post_unfreeze(daemon).await,
        ("POST", "/policy/update") => post_policy_update(daemon, request.body).await,
        ("POST", "/allowlist") => post_allowlist(daemon, request.body).await,
        ("POST", "/setup") => post_setup(daemon, request.body).await,
        ("POST", "/setup/deploy") => post_setup_deploy(daemon).await,
        _ => HttpResponse::refusal(404, format!("no route for {method} {path}")),
    }
}

#[instrument(skip_all)]
async fn get_health(daemon: &Daemon) -> HttpResponse {
    HttpResponse::ok(json!({
        "status": if daemon.config().is_safe_mode() { "safe-mode" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": now_secs(),
        "uptime": now_secs().saturating_sub(daemon.started_at),
    }))
}

#[instrument(skip_all)]
async fn get_address(daemon: &Daemon) -> HttpResponse {
    let graph = daemon.graph();
    let config = graph.config.snapshot().await;
    let public_key = match graph.signer.public_key(KeySlot::Routine) {
        Ok(pk) => pk,
        Err(e) => return HttpResponse::refusal(500, format!("signer: {e}")),
    };
    HttpResponse::ok(json!({
        "walletAddress": config.wallet_address,
        "signerPublicKey": { "x": public_key.x, "y": public_key.y },
        "homeChainId": config.home_chain_id,
    }))
}

#[instrument(skip_all)]
async fn get_capabilities(daemon: &Daemon) -> HttpResponse {
    let graph = daemon.graph();
    let config = graph.config.snapshot().await;
    let Some(wallet) = config.wallet_address else {
        return HttpResponse::refusal(503, "wallet not deployed");
    };
    let profile = config.effective_profile();
    let remaining = graph.policy.remaining_budgets(&profile, now_secs()).await;
    let gas_status = match graph.chain.balance(wallet).await {
        Ok(balance) => crate::userop::gas_signal(balance),
        Err(_) => "low",
    };
    let protocols: Vec<Value> = graph
        .policy
        .protocols()
        .actions()
        .iter()
        .filter(|a| a.chain_id == graph.chain_id)
        .map(|a| {
            json!({
                "address": a.address,
                "selector": a.selector,
                "name": a.human_name,
            })
        })
        .collect();
    HttpResponse::ok(json!({
        "profile": config.profile,
        "limits": {
            "perTxEthCap": profile.per_tx_eth_cap.to_string(),
            "dailyEthCap": profile.daily_eth_cap.to_string(),
            "perTxStableCap": profile.per_tx_stable_cap.to_string(),
            "dailyStableCap": profile.daily_stable_cap.to_string(),
            "maxTxPerHour": profile.max_tx_per_hour,
            "minCooldownSec": profile.min_cooldown_secs,
            "maxSlippageBps": profile.max_slippage_bps,
        },
        "remaining": {
            "dailyEth": remaining.daily_eth.to_string(),
            "dailyStable": remaining.daily_stable.to_string(),
            "txThisHour": remaining.tx_this_hour,
        },
        "gasStatus": gas_status,
        "allowlist": config.allowlist,
        "protocols": protocols,
    }))
}

#[instrument(skip_all)]
async fn get_policy(daemon: &Daemon) -> HttpResponse {
    let config = daemon.config().snapshot().await;
    let profile = config.effective_profile();
    HttpResponse::ok(json!({
        "profile": config.profile,
        "frozen": config.frozen,
        "effective": profile,
    }))
}

#[instrument(skip_all)]
async fn get_audit_log(daemon: &Daemon) -> HttpResponse {
    let graph = daemon.graph();
    let entries = graph.audit.entries().await;
    HttpResponse::ok(json!({ "entries": entries }))
}

#[instrument(skip_all)]
async fn post_decode(daemon: &Daemon, body: Option<Value>) -> HttpResponse {
    let Some(body) = body else {
        return HttpResponse::refusal(400, "missing request body");
    };
    let envelope = match IntentEnvelope::parse(&body) {
        Ok(envelope) => envelope,
        Err(e) => return HttpResponse::refusal(400, e.to_string()),
    };
    let graph = daemon.graph();
    let stablecoins = graph.stablecoins.lock().await.clone();
    let decoded = decode(
        &envelope.intent.calldata,
        envelope.intent.target,
        envelope.intent.value,
        graph.chain_id,
        &stablecoins,
    );
    HttpResponse::ok(json!({
        "summary": decoded.summary,
        "selector": decoded.selector,
        "isKnown": decoded.is_known,
        "action": action_label(&decoded.action),
    }))
}

fn action_label(action: &CallAction) -> &'static str {
    match action {
        CallAction::NativeTransfer { .. } => "native-transfer",
        CallAction::StableTransfer { .. } => "stable-transfer",
        CallAction::TokenTransfer { .. } => "token-transfer",
        CallAction::TokenTransferFrom { .. } => "token-transfer-from",
        CallAction::AllowanceChange { .. } => "allowance-change",
        CallAction::PermitSignature { .. } => "permit",
        CallAction::Permit2Action { .. } => "permit2",
        CallAction::Swap(_) => "swap",
        CallAction::AaveSupply { .. } => "aave-supply",
        CallAction::AaveWithdraw { .. } => "aave-withdraw",
        CallAction::LidoStake { .. } => "lido-stake",
        CallAction::RocketDeposit { .. } => "rocket-deposit",
        CallAction::Unknown => "unknown",
    }
}

/// ETH/stable amounts a decoded action spends, for the ledger.
fn spend_amounts(intent: &Intent, action: &CallAction) -> (u64, u64) {
    match action {
        CallAction::NativeTransfer { amount, .. } => (*amount, 0),
        CallAction::StableTransfer { amount, .. } => (intent.value, *amount),
        _ => (intent.value, 0),
    }
}

#[instrument(skip_all)]
async fn post_sign(daemon: &Daemon, body: Option<Value>) -> HttpResponse {
    let now = now_secs();
    let Some(body) = body else {
        return HttpResponse::refusal(400, "missing request body");
    };
    let envelope = match IntentEnvelope::parse(&body) {
        Ok(envelope) => envelope,
        Err(e) => return HttpResponse::refusal(400, e.to_string()),
    };
    let intent = &envelope.intent;
    if !daemon.admit_sign_request(now).await {
        return HttpResponse::refusal(429, "sign request rate limit reached");
    }

    let graph = daemon.graph();
    let config = graph.config.snapshot().await;
    let Some(wallet) = config.wallet_address else {
        return HttpResponse::refusal(503, "wallet not configured");
    };
    if let Some(hint) = intent.chain_hint {
        if hint != graph.chain_id {
            return HttpResponse::refusal(
                400,
                format!("chain hint {hint} does not match home chain {}", graph.chain_id),
            );
        }
    }

    let stablecoins = graph.stablecoins.lock().await.clone();
    let decoded = decode(
        &intent.calldata,
        intent.target,
        intent.value,
        graph.chain_id,
        &stablecoins,
    );

    let decision = graph.policy.evaluate(intent, &decoded, &config, now).await;
    match decision {
        Decision::Deny { reason } => {
            let (status, verb) = match reason {
                DenyReason::Frozen => (409, "frozen"),
                DenyReason::Other(_) => (403, "denied"),
            };
            audit_intent(&graph, intent, &decoded, verb, &reason.to_string(), None).await;
            HttpResponse::refusal(status, reason.to_string())
        }
        Decision::Allow => run_allow_path(&graph, wallet, intent, &decoded, now).await,
        Decision::RequireApproval { reason } => match &envelope.approval_code {
            None => {
                let approval_hash = compute_approval_hash(
                    graph.chain_id,
                    wallet,
                    intent.target,
                    intent.value,
                    &intent.calldata,
                );
                let created = graph
                    .approvals
                    .create(approval_hash, format!("{}: {reason}", decoded.summary), now)
                    .await;
                if let Err(e) = graph
                    .oracle
                    .post_approval_notification(
                        &created.code,
                        &created.summary,
                        &created.hash_prefix,
                        created.expires_in,
                    )
                    .await
                {
                    tracing::warn!(error = %e, "approval notification failed; code reachable via companion UI");
                }
                audit_intent(&graph, intent, &decoded, "approval_required", &reason, None).await;
                HttpResponse::with_status(
                    202,
                    json!({
                        "summary": created.summary,
                        "hashPrefix": created.hash_prefix,
                        "expiresIn": created.expires_in,
                    }),
                )
            }
            Some(code) => {
                let approval_hash = compute_approval_hash(
                    graph.chain_id,
                    wallet,
                    intent.target,
                    intent.value,
                    &intent.calldata,
                );
                match graph.approvals.verify(code, approval_hash, now).await {
                    VerifyOutcome::Approved => {
                        run_allow_path(&graph, wallet, intent, &decoded, now).await
                    }
                    VerifyOutcome::RateLimited => {
                        audit_intent(&graph, intent, &decoded, "denied", "approval verification rate limited", None)
                            .await;
                        HttpResponse::refusal(429, "approval verification rate limited")
                    }
                    VerifyOutcome::Invalid => {
                        audit_intent(&graph, intent, &decoded, "denied", "invalid approval code", None).await;
                        HttpResponse::refusal(403, "invalid")
                    }
                    VerifyOutcome::Expired => {
                        audit_intent(&graph, intent, &decoded, "denied", "approval code expired", None).await;
                        HttpResponse::refusal(403, "expired")
                    }
                    VerifyOutcome::Revoked => {
                        audit_intent(&graph, intent, &decoded, "denied", "approval code revoked", None).await;
                        HttpResponse::refusal(403, "revoked")
                    }
                }
            }
        },
    }
}

async fn run_allow_path(
    graph: &ServiceGraph,
    wallet: Address,
    intent: &Intent,
    decoded: &DecodedCall,
    now: u64,
) -> HttpResponse {
    match graph
        .sign_and_submit(
            wallet,
            intent.target,
            U256::from(intent.value),
            intent.calldata.clone(),
            None,
        )
        .await
    {
        Ok(hash) => {
            let (eth, stable) = spend_amounts(intent, &decoded.action);
            graph.policy.record_transaction(eth, stable, now).await;
            audit_intent(graph, intent, decoded, "allow", &decoded.summary, Some(&hash.to_string()))
                .await;
            HttpResponse::ok(json!({
                "userOpHash": hash,
                "chainId": graph.chain_id,
            }))
        }
        Err(PipelineError::Gas(shortfall)) => {
            audit_intent(graph, intent, decoded, "denied", &shortfall.to_string(), None).await;
            HttpResponse::with_status(
                402,
                json!({
                    "reason": "insufficient gas balance",
                    "required": shortfall.required.to_string(),
                    "available": shortfall.available.to_string(),
                    "shortfall": shortfall.shortfall.to_string(),
                }),
            )
        }
        Err(PipelineError::Signer(SignerError::Unavailable(msg))) => {
            audit_intent(graph, intent, decoded, "denied", &msg, None).await;
            HttpResponse::refusal(503, format!("signer unavailable: {msg}"))
        }
        Err(e) => {
            audit_intent(graph, intent, decoded, "denied", &e.to_string(), None).await;
            HttpResponse::refusal(500, e.to_string())
        }
    }
}

async fn audit_intent(
    graph: &ServiceGraph,
    intent: &Intent,
    decoded: &DecodedCall,
    decision: &str,
    reason: &str,
    tx_hash: Option<&str>,
) {
    graph
        .audit
        .record(
            &decoded.summary,
            &intent.target.to_string(),
            &intent.value.to_string(),
            decision,
            reason,
            tx_hash,
        )
        .await;
}

#[instrument(skip_all)]
async fn post_panic(daemon: &Daemon) -> HttpResponse {
    let graph = daemon.graph();
    if let Err(e) = graph.config.update(|c| c.frozen = true).await {
        return HttpResponse::refusal(500, format!("persisting freeze: {e}"));
    }
    graph
        .audit
        .record("panic", "", "0", "frozen", "panic freeze engaged", None)
        .await;
    freeze::spawn_onchain_freeze(graph.clone());
    HttpResponse::ok(json!({ "status": "frozen" }))
}

#[instrument(skip_all)]
async fn post_unfreeze(daemon: &Daemon) -> HttpResponse {
    let graph = daemon.graph();
    let config = graph.config.snapshot().await;
    if !config.frozen {
        return HttpResponse::refusal(409, "wallet is not frozen");
    }
    if let Some(wallet) = config.wallet_address {
        match graph.chain.code_at(wallet).await {
            Ok(code) if !code.is_empty() => match graph.chain.wallet_frozen(wallet).await {
                Ok(true) => {
                    return HttpResponse::refusal(409, "wallet is still frozen on-chain");
                }
                Ok(false) => {}
                Err(e) => return HttpResponse::refusal(500, format!("reading frozen(): {e}")),
            },
            Ok(_) => {}
            Err(e) => return HttpResponse::refusal(500, format!("reading wallet code: {e}")),
        }
    }
    match graph.oracle.request_admin_approval("Unfreeze the wallet").await {
        Ok(true) => {}
        Ok(false) => return HttpResponse::refusal(403, "unfreeze denied"),
        Err(e) => return HttpResponse::refusal(403, format!("presence oracle: {e}")),
    }
    if let Err(e) = graph.config.update(|c| c.frozen = false).await {
        return HttpResponse::refusal(500, format!("persisting unfreeze: {e}"));
    }
    graph
        .audit
        .record("unfreeze", "", "0", "allow", "unfreeze confirmed by user", None)
        .await;
    HttpResponse::ok(json!({ "status": "active" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyUpdateBody {
    profile: Option<String>,
    per_tx_eth_cap: Option<u64>,
    daily_eth_cap: Option<u64>,
    per_tx_stable_cap: Option<u64>,
    daily_stable_cap: Option<u64>,
    max_tx_per_hour: Option<u32>,
    min_cooldown_secs: Option<u64>,
    max_slippage_bps: Option<u32>,
    bundler_url: Option<Url>,
    add_stablecoin: Option<StablecoinBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StablecoinBody {
    chain_id: u64,
    address: Address,
    decimals: u8,
}

#[instrument(skip_all)]
async fn post_policy_update(daemon: &Daemon, body: Option<Value>) -> HttpResponse {
    let Some(body) = body else {
        return HttpResponse::refusal(400, "missing request body");
    };
    let update: PolicyUpdateBody = match serde_json::from_value(body) {
        Ok(update) => update,
        Err(e) => return HttpResponse::refusal(400, format!("invalid policy update: {e}")),
    };
    let profile = match update.profile.as_deref().map(ProfileName::from_str).transpose() {
        Ok(profile) => profile,
        Err(e) => return HttpResponse::refusal(400, e),
    };

    let mut changes: Vec<String> = Vec::new();
    if let Some(p) = profile {
        changes.push(format!("switch profile to {p}"));
    }
    for (name, value) in [
        ("per-tx ETH cap", update.per_tx_eth_cap),
        ("daily ETH cap", update.daily_eth_cap),
        ("per-tx stable cap", update.per_tx_stable_cap),
        ("daily stable cap", update.daily_stable_cap),
        ("cooldown", update.min_cooldown_secs),
    ] {
        if let Some(v) = value {
            changes.push(format!("set {name} to {v}"));
        }
    }
    if let Some(v) = update.max_tx_per_hour {
        changes.push(format!("set hourly tx limit to {v}"));
    }
    if let Some(v) = update.max_slippage_bps {
        changes.push(format!("set max slippage to {v} bps"));
    }
    if let Some(url) = &update.bundler_url {
        changes.push(format!("set bundler URL to {url}"));
    }
    if let Some(coin) = &update.add_stablecoin {
        changes.push(format!(
            "register stablecoin {} on chain {}",
            coin.address, coin.chain_id
        ));
    }
    if changes.is_empty() {
        return HttpResponse::refusal(400, "no changes requested");
    }
    let summary = format!("Policy update: {}", changes.join("; "));

    let graph = daemon.graph();
    match graph.oracle.request_admin_approval(&summary).await {
        Ok(true) => {}
        Ok(false) => return HttpResponse::refusal(403, "policy update denied"),
        Err(e) => return HttpResponse::refusal(403, format!("presence oracle: {e}")),
    }

    let result = graph
        .config
        .update(|c| {
            if let Some(p) = profile {
                c.profile = p;
            }
            if let Some(v) = update.per_tx_eth_cap {
                c.overrides.per_tx_eth_cap = Some(v);
            }
            if let Some(v) = update.daily_eth_cap {
                c.overrides.daily_eth_cap = Some(v);
            }
            if let Some(v) = update.per_tx_stable_cap {
                c.overrides.per_tx_stable_cap = Some(v);
            }
            if let Some(v) = update.daily_stable_cap {
                c.overrides.daily_stable_cap = Some(v);
            }
            if let Some(v) = update.max_tx_per_hour {
                c.overrides.max_tx_per_hour = Some(v);
            }
            if let Some(v) = update.min_cooldown_secs {
                c.overrides.min_cooldown_secs = Some(v);
            }
            if let Some(v) = update.max_slippage_bps {
                c.overrides.max_slippage_bps = Some(v);
            }
            if let Some(url) = &update.bundler_url {
                c.bundler_url = Some(url.clone());
            }
        })
        .await;
    if let Err(e) = result {
        return HttpResponse::refusal(500, format!("persisting policy: {e}"));
    }
    if let Some(coin) = &update.add_stablecoin {
        graph
            .stablecoins
            .lock()
            .await
            .insert(coin.chain_id, coin.address, coin.decimals);
    }
    if let Err(e) = daemon.reconfigure().await {
        return HttpResponse::refusal(500, format!("rebuilding services: {e}"));
    }
    graph
        .audit
        .record("policy-update", "", "0", "allow", &summary, None)
        .await;
    HttpResponse::ok(json!({ "status": "updated", "summary": summary }))
}

#[derive(Debug, Deserialize)]
struct AllowlistBody {
    action: String,
    address: Address,
}

#[instrument(skip_all)]
async fn post_allowlist(daemon: &Daemon, body: Option<Value>) -> HttpResponse {
    let Some(body) = body else {
        return HttpResponse::refusal(400, "missing request body");
    };
    let request: AllowlistBody = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => return HttpResponse::refusal(400, format!("invalid allowlist request: {e}")),
    };
    let add = match request.action.as_str() {
        "add" => true,
        "remove" => false,
        other => return HttpResponse::refusal(400, format!("unknown action `{other}`")),
    };
    let summary = if add {
        format!("Add {} to the allowlist", request.address)
    } else {
        format!("Remove {} from the allowlist", request.address)
    };

    let graph = daemon.graph();
    match graph.oracle.request_admin_approval(&summary).await {
        Ok(true) => {}
        Ok(false) => return HttpResponse::refusal(403, "allowlist change denied"),
        Err(e) => return HttpResponse::refusal(403, format!("presence oracle: {e}")),
    }

    let result = graph
        .config
        .update(|c| {
            if add {
                c.allowlist.insert(request.address);
            } else {
                c.allowlist.remove(&request.address);
            }
        })
        .await;
    match result {
        Ok(config) => {
            graph
                .audit
                .record("allowlist", &request.address.to_string(), "0", "allow", &summary, None)
                .await;
            HttpResponse::ok(json!({ "status": "updated", "allowlist": config.allowlist }))
        }
        Err(e) => HttpResponse::refusal(500, format!("persisting allowlist: {e}")),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetupBody {
    chain_id: u64,
    profile: String,
    recovery_address: Option<Address>,
    factory_address: Option<Address>,
}

#[instrument(skip_all)]
async fn post_setup(daemon: &Daemon, body: Option<Value>) -> HttpResponse {
    let Some(body) = body else {
        return HttpResponse::refusal(400, "missing request body");
    };
    let setup: SetupBody = match serde_json::from_value(body) {
        Ok(setup) => setup,
        Err(e) => return HttpResponse::refusal(400, format!("invalid setup request: {e}")),
    };
    if crate::chain::chain_target(setup.chain_id).is_none() {
        return HttpResponse::refusal(400, format!("unsupported chain id {}", setup.chain_id));
    }
    let profile = match ProfileName::from_str(&setup.profile) {
        Ok(profile) => profile,
        Err(e) => return HttpResponse::refusal(400, e),
    };

    let result = daemon
        .config()
        .update(|c| {
            c.home_chain_id = setup.chain_id;
            c.profile = profile;
            c.recovery_address = setup.recovery_address;
            if setup.factory_address.is_some() {
                c.factory_address = setup.factory_address;
            }
        })
        .await;
    if let Err(e) = result {
        return HttpResponse::refusal(500, format!("persisting setup: {e}"));
    }
    if let Err(e) = daemon.reconfigure().await {
        return HttpResponse::refusal(500, format!("rebuilding services: {e}"));
    }

    // Resolve the counterfactual wallet from the factory when one is known.
    let graph = daemon.graph();
    let config = graph.config.snapshot().await;
    let mut wallet = config.wallet_address;
    if let Some(factory) = config.factory_address {
        let public_key = match graph.signer.public_key(KeySlot::Routine) {
            Ok(pk) => pk,
            Err(e) => return HttpResponse::refusal(500, format!("signer: {e}")),
        };
        match graph
            .chain
            .counterfactual_address(factory, public_key.x, public_key.y, U256::ZERO)
            .await
        {
            Ok(address) => {
                wallet = Some(address);
                if let Err(e) = graph.config.update(|c| c.wallet_address = Some(address)).await {
                    return HttpResponse::refusal(500, format!("persisting wallet address: {e}"));
                }
            }
            Err(e) => {
                return HttpResponse::refusal(500, format!("resolving counterfactual address: {e}"))
            }
        }
    }

    graph
        .audit
        .record(
            "setup",
            &wallet.map(|w| w.to_string()).unwrap_or_default(),
            "0",
            "allow",
            &format!("configured chain {} profile {profile}", setup.chain_id),
            None,
        )
        .await;
    HttpResponse::ok(json!({
        "chainId": setup.chain_id,
        "profile": profile,
        "walletAddress": wallet,
    }))
}

#[instrument(skip_all)]
async fn post_setup_deploy(daemon: &Daemon) -> HttpResponse {
    let graph = daemon.graph();
    let config = graph.config.snapshot().await;
    let Some(wallet) = config.wallet_address else {
        return HttpResponse::refusal(503, "wallet not configured");
    };
    let Some(factory) = config.factory_address else {
        return HttpResponse::refusal(503, "no factory configured");
    };
    match graph.chain.code_at(wallet).await {
        Ok(code) if !code.is_empty() => {
            return HttpResponse::refusal(400, "wallet is already deployed");
        }
        Ok(_) => {}
        Err(e) => return HttpResponse::refusal(500, format!("reading wallet code: {e}")),
    }
    let public_key = match graph.signer.public_key(KeySlot::Routine) {
        Ok(pk) => pk,
        Err(e) => return HttpResponse::refusal(500, format!("signer: {e}")),
    };
    let mut init_code = factory.to_vec();
    init_code.extend_from_slice(
        &crate::chain::IAccountFactory::createAccountCall {
            pubKeyX: public_key.x,
            pubKeyY: public_key.y,
            salt: U256::ZERO,
        }
        .abi_encode(),
    );

    match graph
        .sign_and_submit(wallet, wallet, U256::ZERO, Bytes::new(), Some(Bytes::from(init_code)))
        .await
    {
        Ok(hash) => {
            graph
                .audit
                .record(
                    "deploy",
                    &wallet.to_string(),
                    "0",
                    "allow",
                    "wallet deployment submitted",
                    Some(&hash.to_string()),
                )
                .await;
            HttpResponse::ok(json!({ "userOpHash": hash, "chainId": graph.chain_id }))
        }
        Err(PipelineError::Gas(shortfall)) => HttpResponse::with_status(
            402,
            json!({
                "reason": "insufficient gas balance for deployment",
                "shortfall": shortfall.shortfall.to_string(),
            }),
        ),
        Err(e) => HttpResponse::refusal(500, e.to_string()),
    }
}
