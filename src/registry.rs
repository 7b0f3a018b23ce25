//! Stablecoin and protocol registries.
//!
//! The stablecoin registry maps `(chain id, token address)` to decimals and
//! is bootstrapped with canonical USDC on Ethereum mainnet and Base; anything
//! beyond that arrives only through the oracle-gated admin path. The protocol
//! registry is the per-profile allowlist of `(chain, contract, selector)`
//! actions eligible for autopilot.

use alloy_primitives::{address, Address, FixedBytes};
use alloy_sol_types::SolCall;
use std::collections::{HashMap, HashSet};

use crate::config::ProfileName;
use crate::decode::{AavePool, Lido, RocketDepositPool, UniversalRouter};

pub const USDC_MAINNET: Address = address!("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
pub const USDC_BASE: Address = address!("0x833589fcd6edb6e08f4c7c32d4f71b54bda02913");

pub const UNIVERSAL_ROUTER: Address = address!("0x3fc91a3afd70395cd496c647d5a6cc9d4b2b7fad");
pub const AAVE_POOL_MAINNET: Address = address!("0x87870bca3f3fd6335c3f4ce8392d69350b4fa4e2");
pub const AAVE_POOL_BASE: Address = address!("0xa238dd80c259a72e81d7e4664a9801593f98d1c5");
pub const LIDO_STETH: Address = address!("0xae7ab96520de3a18e5e111b5eaab095312d7fe84");
pub const ROCKET_DEPOSIT_POOL: Address = address!("0xdd3f50f8a6cafbe9b31a427582963f465e745af8");

/// `(chainId, lower(address)) → decimals`. Decimals are display metadata
/// only; policy math happens in base units.
#[derive(Debug, Clone)]
pub struct StablecoinRegistry {
    map: HashMap<(u64, Address), u8>,
}

impl StablecoinRegistry {
    /// Canonical USDC deployments on the supported chains.
    pub fn bootstrap() -> Self {
        let mut map = HashMap::new();
        map.insert((1, USDC_MAINNET), 6);
        map.insert((8453, USDC_BASE), 6);
        Self { map }
    }

    pub fn is_stablecoin(&self, chain_id: u64, token: Address) -> bool {
        self.map.contains_key(&(chain_id, token))
    }

    pub fn decimals(&self, chain_id: u64, token: Address) -> Option<u8> {
        self.map.get(&(chain_id, token)).copied()
    }

    /// Admin-path extension. Reached only through an oracle-approved
    /// `/policy/update`.
    pub fn insert(&mut self, chain_id: u64, token: Address, decimals: u8) {
        self.map.insert((chain_id, token), decimals);
    }

    pub fn entries(&self) -> impl Iterator<Item = (u64, Address, u8)> + '_ {
        self.map.iter().map(|((c, a), d)| (*c, *a, *d))
    }
}

/// A single autopilot-eligible contract action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedAction {
    pub chain_id: u64,
    pub address: Address,
    pub selector: FixedBytes<4>,
    pub human_name: &'static str,
}

/// Profile-dependent set of allowed DeFi actions with O(1) lookup on
/// `(chainId, address, selector)`.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    index: HashSet<(u64, Address, FixedBytes<4>)>,
    actions: Vec<AllowedAction>,
}

impl ProtocolRegistry {
    pub fn for_profile(profile: ProfileName) -> Self {
        let mut actions: Vec<AllowedAction> = Vec::new();

        // Swaps through the Universal Router are in every pack.
        for chain_id in [1u64, 8453] {
            actions.push(AllowedAction {
                chain_id,
                address: UNIVERSAL_ROUTER,
                selector: UniversalRouter::execute_0Call::SELECTOR.into(),
                human_name: "Uniswap swap",
            });
            actions.push(AllowedAction {
                chain_id,
                address: UNIVERSAL_ROUTER,
                selector: UniversalRouter::execute_1Call::SELECTOR.into(),
                human_name: "Uniswap swap",
            });
        }

        if profile == ProfileName::Autonomous {
            for (chain_id, pool) in [(1u64, AAVE_POOL_MAINNET), (8453, AAVE_POOL_BASE)] {
                actions.push(AllowedAction {
                    chain_id,
                    address: pool,
                    selector: AavePool::supplyCall::SELECTOR.into(),
                    human_name: "Aave supply",
                });
                actions.push(AllowedAction {
                    chain_id,
                    address: pool,
                    selector: AavePool::depositCall::SELECTOR.into(),
                    human_name: "Aave deposit",
                });
                actions.push(AllowedAction {
                    chain_id,
                    address: pool,
                    selector: AavePool::withdrawCall::SELECTOR.into(),
                    human_name: "Aave withdraw",
                });
            }
            actions.push(AllowedAction {
                chain_id: 1,
                address: LIDO_STETH,
                selector: Lido::submitCall::SELECTOR.into(),
                human_name: "Lido stake",
            });
            actions.push(AllowedAction {
                chain_id: 1,
                address: ROCKET_DEPOSIT_POOL,
                selector: RocketDepositPool::depositCall::SELECTOR.into(),
                human_name: "Rocket Pool deposit",
            });
        }

        let index = actions
            .iter()
            .map(|a| (a.chain_id, a.address, a.selector))
            .collect();
        Self { index, actions }
    }

    pub fn allows(&self, chain_id: u64, address: Address, selector: FixedBytes<4>) -> bool {
        self.index.contains(&(chain_id, address, selector))
    }

    pub fn actions(&self) -> &[AllowedAction] {
        &self.actions
    }
}
