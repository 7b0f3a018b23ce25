//! The default-deny policy engine.
//!
//! Every sign request funnels through [`PolicyEngine::evaluate`], which walks
//! a fixed order: frozen wallet, blocked selector, decode result, stablecoin
//! check, protocol registry, spending limits, allowlist. Anything that falls
//! through the table requires a human. The engine is the only mutator of the
//! spending state; `record_transaction` runs on the allow path after the
//! bundler acknowledged the submission.

use alloy_primitives::{Address, U256};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chain::ChainRpc;
use crate::config::{DaemonConfig, SecurityProfile};
use crate::decode::{is_blocked_prefix, CallAction, DecodedCall, SwapParams};
use crate::intent::Intent;
use crate::registry::ProtocolRegistry;
use crate::spending::{RemainingBudgets, SpendingTracker};

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    RequireApproval { reason: String },
    Deny { reason: DenyReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    Frozen,
    Other(String),
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frozen => write!(f, "wallet is frozen"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Formats basis points as a percentage with one decimal, `6800 → "68.0%"`.
fn bps_percent(bps: u64) -> String {
    format!("{}.{}%", bps / 100, (bps % 100) / 10)
}

pub struct PolicyEngine {
    chain: Arc<dyn ChainRpc>,
    protocols: ProtocolRegistry,
    spending: Arc<Mutex<SpendingTracker>>,
}

impl PolicyEngine {
    /// `spending` is shared so the ledger survives a service-graph rebuild.
    pub fn new(
        chain: Arc<dyn ChainRpc>,
        protocols: ProtocolRegistry,
        spending: Arc<Mutex<SpendingTracker>>,
    ) -> Self {
        Self {
            chain,
            protocols,
            spending,
        }
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    /// The authoritative evaluation order.
    pub async fn evaluate(
        &self,
        intent: &Intent,
        decoded: &DecodedCall,
        config: &DaemonConfig,
        now: u64,
    ) -> Decision {
        // 1. Frozen wallet dominates everything.
        if config.frozen {
            return Decision::Deny {
                reason: DenyReason::Frozen,
            };
        }

        // 2. Blocked selectors always need a human, prefix-only.
        if is_blocked_prefix(&intent.calldata) {
            return Decision::RequireApproval {
                reason: format!("Blocked selector: {}", decoded.summary),
            };
        }

        // 3. Unknown calldata fails closed.
        if !decoded.is_known {
            return Decision::RequireApproval {
                reason: format!("Unknown calldata: {}", decoded.summary),
            };
        }

        let profile = config.effective_profile();

        match &decoded.action {
            // 4. A transfer on a token the registry does not know.
            CallAction::TokenTransfer { .. } | CallAction::TokenTransferFrom { .. } => {
                Decision::RequireApproval {
                    reason: "Unknown token".to_string(),
                }
            }

            // 5. Protocol-registry actions.
            CallAction::Swap(params) => {
                let Some(selector) = decoded.selector else {
                    return Decision::RequireApproval {
                        reason: "Unknown calldata".to_string(),
                    };
                };
                if !self
                    .protocols
                    .allows(self.chain.chain_id(), intent.target, selector)
                {
                    return Decision::RequireApproval {
                        reason: format!("Contract not in protocol pack: {}", decoded.summary),
                    };
                }
                if let Some(reason) = self.verify_slippage(params, &profile).await {
                    return Decision::RequireApproval { reason };
                }
                self.spend_gate(intent.value, 0, &profile, &decoded.summary, now)
                    .await
            }
            CallAction::AaveSupply { .. }
            | CallAction::AaveWithdraw { .. }
            | CallAction::LidoStake { .. }
            | CallAction::RocketDeposit { .. } => {
                let Some(selector) = decoded.selector else {
                    return Decision::RequireApproval {
                        reason: "Unknown calldata".to_string(),
                    };
                };
                if !self
                    .protocols
                    .allows(self.chain.chain_id(), intent.target, selector)
                {
                    return Decision::RequireApproval {
                        reason: format!("Contract not in protocol pack: {}", decoded.summary),
                    };
                }
                self.spend_gate(intent.value, 0, &profile, &decoded.summary, now)
                    .await
            }

            // 6. Native and stablecoin transfers: limits, then allowlist.
            CallAction::NativeTransfer { to, amount } => {
                self.transfer_gate(*to, *amount, 0, config, &profile, &decoded.summary, now)
                    .await
            }
            CallAction::StableTransfer { to, amount, .. } => {
                self.transfer_gate(*to, intent.value, *amount, config, &profile, &decoded.summary, now)
                    .await
            }

            // 7. Everything else needs a human.
            _ => Decision::RequireApproval {
                reason: decoded.summary.clone(),
            },
        }
    }

    async fn transfer_gate(
        &self,
        to: Address,
        eth: u64,
        stable: u64,
        config: &DaemonConfig,
        profile: &SecurityProfile,
        summary: &str,
        now: u64,
    ) -> Decision {
        let mut spending = self.spending.lock().await;
        if let Err(denied) = spending.check(eth, stable, profile, now) {
            return Decision::RequireApproval {
                reason: format!("{summary}: {denied}"),
            };
        }
        drop(spending);
        if config.allowlist.contains(&to) || (eth == 0 && stable == 0) {
            Decision::Allow
        } else {
            Decision::RequireApproval {
                reason: format!("{summary}: recipient not allowlisted"),
            }
        }
    }

    async fn spend_gate(
        &self,
        eth: u64,
        stable: u64,
        profile: &SecurityProfile,
        summary: &str,
        now: u64,
    ) -> Decision {
        let mut spending = self.spending.lock().await;
        match spending.check(eth, stable, profile, now) {
            Ok(()) => Decision::Allow,
            Err(denied) => Decision::RequireApproval {
                reason: format!("{summary}: {denied}"),
            },
        }
    }

    /// Slippage verification for an exact-input Universal Router swap.
    /// `None` means no concern; `Some(reason)` gates the request.
    async fn verify_slippage(
        &self,
        params: &SwapParams,
        profile: &SecurityProfile,
    ) -> Option<String> {
        if params.is_multi_hop {
            return Some("Multi-hop swap requires approval".to_string());
        }
        let Some(quoter) = self.chain.quoter() else {
            return Some("No quoter available on this chain".to_string());
        };
        let quoted = match self
            .chain
            .quote_exact_input_single(
                quoter,
                params.token_in,
                params.token_out,
                U256::from(params.amount_in),
                params.fee,
            )
            .await
        {
            Ok(quoted) => quoted,
            Err(e) => {
                tracing::warn!(error = %e, "quoter call failed, gating swap");
                return Some(format!("Quoter unavailable: {e}"));
            }
        };
        if quoted.is_zero() {
            return Some("Quoter returned a zero quote".to_string());
        }
        let quoted_u128: u128 = quoted.try_into().unwrap_or(u128::MAX);
        let min = params.amount_out_min as u128;
        if min >= quoted_u128 {
            return None;
        }
        let actual_bps = ((quoted_u128 - min).saturating_mul(10_000) / quoted_u128) as u64;
        if actual_bps > profile.max_slippage_bps as u64 {
            return Some(format!(
                "Slippage {} exceeds limit {}",
                bps_percent(actual_bps),
                bps_percent(profile.max_slippage_bps as u64)
            ));
        }
        None
    }

    /// Books a spend that went on-chain.
    pub async fn record_transaction(&self, eth: u64, stable: u64, now: u64) {
        self.spending.lock().await.record(eth, stable, now);
    }

    pub async fn remaining_budgets(
        &self,
        profile: &SecurityProfile,
        now: u64,
    ) -> RemainingBudgets {
        self.spending.lock().await.remaining_budgets(profile, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;
    use crate::config::DaemonConfig;
    use crate::decode::{decode, encode_v3_path, Erc20, UniversalRouter, V3_SWAP_EXACT_IN};
    use crate::registry::{ProtocolRegistry, StablecoinRegistry, UNIVERSAL_ROUTER, USDC_BASE};
    use crate::spending::SpendingTracker;
    use alloy_primitives::{address, Bytes, B256};
    use alloy_sol_types::{SolCall, SolValue};

    const NOW: u64 = 1_750_000_000;
    const ALLOWED: Address = address!("0x00000000000000000000000000000000000cafe0");
    const OTHER: Address = address!("0x00000000000000000000000000000000000000bb");
    const WETH_BASE: Address = address!("0x4200000000000000000000000000000000000006");

    /// Chain fake with a scripted quoter.
    struct QuoterChain {
        quote: Result<U256, ()>,
        has_quoter: bool,
    }

    #[async_trait::async_trait]
    impl ChainRpc for QuoterChain {
        fn chain_id(&self) -> u64 {
            8453
        }
        fn quoter(&self) -> Option<Address> {
            self.has_quoter.then(|| address!("0x3d4e44eb1374240ce5f1b871ab261cd16335b76a"))
        }
        fn weth(&self) -> Address {
            WETH_BASE
        }
        async fn balance(&self, _: Address) -> Result<U256, ChainError> {
            Ok(U256::MAX)
        }
        async fn gas_price(&self) -> Result<u128, ChainError> {
            Ok(1_000_000_000)
        }
        async fn transaction_count(&self, _: Address) -> Result<u64, ChainError> {
            Ok(0)
        }
        async fn code_at(&self, _: Address) -> Result<Bytes, ChainError> {
            Ok(Bytes::new())
        }
        async fn entry_point_nonce(&self, _: Address, _: Address) -> Result<U256, ChainError> {
            Ok(U256::ZERO)
        }
        async fn wallet_frozen(&self, _: Address) -> Result<bool, ChainError> {
            Ok(false)
        }
        async fn counterfactual_address(
            &self,
            _: Address,
            _: B256,
            _: B256,
            _: U256,
        ) -> Result<Address, ChainError> {
            Ok(Address::ZERO)
        }
        async fn quote_exact_input_single(
            &self,
            _: Address,
            _: Address,
            _: Address,
            _: U256,
            _: u32,
        ) -> Result<U256, ChainError> {
            self.quote.map_err(|_| ChainError::Rpc("quoter down".into()))
        }
        async fn call_raw(&self, _: Address, _: Bytes) -> Result<Bytes, ChainError> {
            Ok(Bytes::new())
        }
    }

    fn engine_with_quote(quote: Result<U256, ()>) -> PolicyEngine {
        PolicyEngine::new(
            Arc::new(QuoterChain {
                quote,
                has_quoter: true,
            }),
            ProtocolRegistry::for_profile(crate::config::ProfileName::Balanced),
            Arc::new(Mutex::new(SpendingTracker::new(NOW))),
        )
    }

    fn config_with_allowlist() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.allowlist.insert(ALLOWED);
        config
    }

    fn native_intent(target: Address, value: u64) -> Intent {
        Intent {
            target,
            calldata: Bytes::new(),
            value,
            chain_hint: None,
        }
    }

    async fn eval(engine: &PolicyEngine, config: &DaemonConfig, intent: &Intent) -> Decision {
        let decoded = decode(
            &intent.calldata,
            intent.target,
            intent.value,
            8453,
            &StablecoinRegistry::bootstrap(),
        );
        engine.evaluate(intent, &decoded, config, NOW).await
    }

    #[tokio::test]
    async fn allowlisted_native_transfer_within_limits_is_allowed() {
        let engine = engine_with_quote(Ok(U256::ZERO));
        let config = config_with_allowlist();
        let intent = native_intent(ALLOWED, 10_000_000_000_000_000);
        assert_eq!(eval(&engine, &config, &intent).await, Decision::Allow);
    }

    #[tokio::test]
    async fn frozen_dominates_allowlist() {
        let engine = engine_with_quote(Ok(U256::ZERO));
        let mut config = config_with_allowlist();
        config.frozen = true;
        let intent = native_intent(ALLOWED, 0);
        assert_eq!(
            eval(&engine, &config, &intent).await,
            Decision::Deny {
                reason: DenyReason::Frozen
            }
        );
    }

    #[tokio::test]
    async fn per_tx_cap_gates_even_allowlisted() {
        let engine = engine_with_quote(Ok(U256::ZERO));
        let config = config_with_allowlist();
        let intent = native_intent(ALLOWED, 60_000_000_000_000_000);
        match eval(&engine, &config, &intent).await {
            Decision::RequireApproval { reason } => {
                assert!(reason.contains("0.0600"), "{reason}");
            }
            other => panic!("expected approval gate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_allowlisted_recipient_requires_approval() {
        let engine = engine_with_quote(Ok(U256::ZERO));
        let config = config_with_allowlist();
        let intent = native_intent(OTHER, 10_000_000_000_000_000);
        match eval(&engine, &config, &intent).await {
            Decision::RequireApproval { reason } => {
                assert!(reason.contains("not allowlisted"));
            }
            other => panic!("expected approval gate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_amount_transfer_is_allowed_without_allowlist() {
        let engine = engine_with_quote(Ok(U256::ZERO));
        let config = config_with_allowlist();
        let intent = native_intent(OTHER, 0);
        assert_eq!(eval(&engine, &config, &intent).await, Decision::Allow);
    }

    #[tokio::test]
    async fn blocked_selector_never_allows() {
        let engine = engine_with_quote(Ok(U256::ZERO));
        let config = config_with_allowlist();
        let approve = Erc20::approveCall {
            spender: OTHER,
            amount: U256::ZERO,
        };
        let intent = Intent {
            target: ALLOWED, // allowlisting the target must not matter
            calldata: Bytes::from(approve.abi_encode()),
            value: 0,
            chain_hint: None,
        };
        match eval(&engine, &config, &intent).await {
            Decision::RequireApproval { reason } => {
                assert!(reason.contains("Blocked selector"), "{reason}");
            }
            other => panic!("blocked selector produced {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_token_transfer_requires_approval() {
        let engine = engine_with_quote(Ok(U256::ZERO));
        let config = config_with_allowlist();
        let transfer = Erc20::transferCall {
            to: ALLOWED,
            amount: U256::from(5u64),
        };
        let intent = Intent {
            target: OTHER, // not a registry stablecoin
            calldata: Bytes::from(transfer.abi_encode()),
            value: 0,
            chain_hint: None,
        };
        match eval(&engine, &config, &intent).await {
            Decision::RequireApproval { reason } => {
                assert!(reason.contains("Unknown token"));
            }
            other => panic!("expected approval gate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stable_transfer_within_limits_to_allowlisted_is_allowed() {
        let engine = engine_with_quote(Ok(U256::ZERO));
        let config = config_with_allowlist();
        let transfer = Erc20::transferCall {
            to: ALLOWED,
            amount: U256::from(50_000_000u64),
        };
        let intent = Intent {
            target: USDC_BASE,
            calldata: Bytes::from(transfer.abi_encode()),
            value: 0,
            chain_hint: None,
        };
        // The USDC contract itself is not allowlisted; the recipient is what
        // matters for a stablecoin transfer.
        assert_eq!(eval(&engine, &config, &intent).await, Decision::Allow);
    }

    fn swap_intent(amount_in: u64, amount_out_min: u64) -> Intent {
        let path = encode_v3_path(WETH_BASE, 500, USDC_BASE);
        let input = (
            OTHER,
            U256::from(amount_in),
            U256::from(amount_out_min),
            path,
            true,
        )
            .abi_encode_params();
        let call = UniversalRouter::execute_0Call {
            commands: Bytes::from(vec![V3_SWAP_EXACT_IN]),
            inputs: vec![Bytes::from(input)],
            deadline: U256::from(1_900_000_000u64),
        };
        Intent {
            target: UNIVERSAL_ROUTER,
            calldata: Bytes::from(call.abi_encode()),
            value: 0,
            chain_hint: None,
        }
    }

    #[tokio::test]
    async fn swap_slippage_above_cap_is_gated() {
        // quoted 250e6, accepted min 80e6 -> 6800 bps vs 100 bps cap.
        let engine = engine_with_quote(Ok(U256::from(250_000_000u64)));
        let config = config_with_allowlist();
        let intent = swap_intent(100_000_000_000_000_000, 80_000_000);
        match eval(&engine, &config, &intent).await {
            Decision::RequireApproval { reason } => {
                assert_eq!(reason, "Slippage 68.0% exceeds limit 1.0%");
            }
            other => panic!("expected slippage gate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn swap_with_generous_min_out_is_allowed() {
        let engine = engine_with_quote(Ok(U256::from(250_000_000u64)));
        let config = config_with_allowlist();
        let intent = swap_intent(100_000_000_000_000_000, 249_000_000);
        // 40 bps < 100 bps cap.
        assert_eq!(eval(&engine, &config, &intent).await, Decision::Allow);
    }

    #[tokio::test]
    async fn quoter_failure_gates_swap() {
        let engine = engine_with_quote(Err(()));
        let config = config_with_allowlist();
        let intent = swap_intent(1_000, 900);
        match eval(&engine, &config, &intent).await {
            Decision::RequireApproval { reason } => {
                assert!(reason.contains("Quoter unavailable"));
            }
            other => panic!("expected quoter gate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_quoter_gates_swap() {
        let engine = PolicyEngine::new(
            Arc::new(QuoterChain {
                quote: Ok(U256::from(1u64)),
                has_quoter: false,
            }),
            ProtocolRegistry::for_profile(crate::config::ProfileName::Balanced),
            Arc::new(Mutex::new(SpendingTracker::new(NOW))),
        );
        let config = config_with_allowlist();
        let intent = swap_intent(1_000, 999);
        match eval(&engine, &config, &intent).await {
            Decision::RequireApproval { reason } => {
                assert!(reason.contains("No quoter"));
            }
            other => panic!("expected quoter gate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn record_transaction_feeds_the_ledger() {
        let engine = engine_with_quote(Ok(U256::ZERO));
        engine.record_transaction(10_000_000_000_000_000, 0, NOW).await;
        let remaining = engine
            .remaining_budgets(&SecurityProfile::balanced(), NOW + 1)
            .await;
        assert_eq!(
            remaining.daily_eth,
            SecurityProfile::balanced().daily_eth_cap - 10_000_000_000_000_000
        );
    }
}
