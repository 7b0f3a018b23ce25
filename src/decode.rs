//! Calldata recognition.
//!
//! Pure, deterministic decoding of intent calldata into a [`DecodedCall`].
//! Everything the policy engine reasons about flows through here: native and
//! token transfers, the allowance family, both permit variants, Permit2,
//! Universal Router swaps, and the staking entry points. Anything the table
//! does not recognize is `Unknown` — the policy engine treats that as
//! approval-required, so this module fails closed by construction.
//!
//! Selector constants come from the `sol!`-generated call types; no selector
//! is ever written out as hex by hand.

use alloy_primitives::{Address, Bytes, FixedBytes, U256};
use alloy_sol_types::{sol, SolCall, SolValue};
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::intent::{format_eth, format_stable};
use crate::registry::StablecoinRegistry;
use crate::util::shorten;

sol! {
    /// ERC-20 surface the daemon recognizes, including the EIP-2612 permit.
    interface Erc20 {
        function transfer(address to, uint256 amount) external returns (bool);
        function transferFrom(address from, address to, uint256 amount) external returns (bool);
        function approve(address spender, uint256 amount) external returns (bool);
        function increaseAllowance(address spender, uint256 addedValue) external returns (bool);
        function decreaseAllowance(address spender, uint256 subtractedValue) external returns (bool);
        function setApprovalForAll(address operator, bool approved) external;
        function permit(address owner, address spender, uint256 value, uint256 deadline, uint8 v, bytes32 r, bytes32 s) external;
    }

    /// DAI's pre-2612 permit variant.
    interface DaiLike {
        function permit(address holder, address spender, uint256 nonce, uint256 expiry, bool allowed, uint8 v, bytes32 r, bytes32 s) external;
    }

    /// Permit2 entry points (AllowanceTransfer + SignatureTransfer).
    interface Permit2 {
        struct PermitDetails { address token; uint160 amount; uint48 expiration; uint48 nonce; }
        struct PermitSingle { PermitDetails details; address spender; uint256 sigDeadline; }
        struct PermitBatch { PermitDetails[] details; address spender; uint256 sigDeadline; }
        struct TokenPermissions { address token; uint256 amount; }
        struct PermitTransferFrom { TokenPermissions permitted; uint256 nonce; uint256 deadline; }
        struct SignatureTransferDetails { address to; uint256 requestedAmount; }

        function approve(address token, address spender, uint160 amount, uint48 expiration) external;
        function permit(address owner, PermitSingle memory permitSingle, bytes calldata signature) external;
        function permit(address owner, PermitBatch memory permitBatch, bytes calldata signature) external;
        function permitTransferFrom(PermitTransferFrom memory permit, SignatureTransferDetails calldata transferDetails, address owner, bytes calldata signature) external;
        function permitWitnessTransferFrom(PermitTransferFrom memory permit, SignatureTransferDetails calldata transferDetails, address owner, bytes32 witness, string calldata witnessTypeString, bytes calldata signature) external;
        function transferFrom(address from, address to, uint160 amount, address token) external;
    }

    /// Uniswap Universal Router. The three-argument form carries a deadline.
    interface UniversalRouter {
        function execute(bytes calldata commands, bytes[] calldata inputs, uint256 deadline) external payable;
        function execute(bytes calldata commands, bytes[] calldata inputs) external payable;
    }

    /// Aave pool entry points (v3 `supply`, v2 `deposit`).
    interface AavePool {
        function supply(address asset, uint256 amount, address onBehalfOf, uint16 referralCode) external;
        function deposit(address asset, uint256 amount, address onBehalfOf, uint16 referralCode) external;
        function withdraw(address asset, uint256 amount, address to) external returns (uint256);
    }

    /// Lido staking.
    interface Lido {
        function submit(address _referral) external payable returns (uint256);
    }

    /// Rocket Pool deposit pool.
    interface RocketDepositPool {
        function deposit() external payable;
    }
}

/// Universal Router command byte for a Uniswap v3 exact-input swap. The top
/// two bits of a command byte are flags; the command id is the low six.
pub const V3_SWAP_EXACT_IN: u8 = 0x00;
const COMMAND_MASK: u8 = 0x3f;

/// Single-hop v3 path: 20-byte token, 3-byte fee, 20-byte token.
const SINGLE_HOP_PATH_LEN: usize = 43;
const HOP_LEN: usize = 23;

/// Parameters recovered from a Universal Router exact-input swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapParams {
    pub amount_in: u64,
    pub amount_out_min: u64,
    pub token_in: Address,
    pub token_out: Address,
    pub fee: u32,
    pub is_multi_hop: bool,
    pub recipient: Address,
    pub payer_is_user: bool,
    pub commands: Bytes,
}

/// What a piece of calldata does, as far as the policy engine cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallAction {
    NativeTransfer { to: Address, amount: u64 },
    /// ERC-20 `transfer` where the target token is a registry stablecoin.
    StableTransfer { token: Address, to: Address, amount: u64 },
    /// ERC-20 `transfer` on a token the registry does not know.
    TokenTransfer { token: Address, to: Address, amount: u64 },
    TokenTransferFrom { token: Address, from: Address, to: Address, amount: u64 },
    /// `approve` / `increaseAllowance` / `decreaseAllowance` / `setApprovalForAll`.
    AllowanceChange { token: Address, kind: &'static str },
    /// EIP-2612 or DAI permit.
    PermitSignature { token: Address, kind: &'static str },
    /// Any Permit2 entry point.
    Permit2Action { kind: &'static str },
    /// Universal Router execute with a recoverable exact-input swap.
    Swap(SwapParams),
    AaveSupply { pool: Address, asset: Address, amount: u64 },
    AaveWithdraw { pool: Address, asset: Address, amount: u64 },
    LidoStake { amount: u64 },
    RocketDeposit { amount: u64 },
    Unknown,
}

/// Decoder output: the action, a human summary, the selector (when calldata
/// has one), and whether the selector table recognized it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCall {
    pub action: CallAction,
    pub summary: String,
    pub selector: Option<FixedBytes<4>>,
    pub is_known: bool,
}

/// Selectors that always route to human approval, regardless of target,
/// amount, or context. Detection is prefix-only.
static BLOCKED_SELECTORS: LazyLock<HashSet<[u8; 4]>> = LazyLock::new(|| {
    HashSet::from([
        Erc20::approveCall::SELECTOR,
        Erc20::increaseAllowanceCall::SELECTOR,
        Erc20::decreaseAllowanceCall::SELECTOR,
        Erc20::setApprovalForAllCall::SELECTOR,
        Erc20::permitCall::SELECTOR,
        DaiLike::permitCall::SELECTOR,
        Permit2::approveCall::SELECTOR,
        Permit2::permit_0Call::SELECTOR,
        Permit2::permit_1Call::SELECTOR,
        Permit2::permitTransferFromCall::SELECTOR,
        Permit2::permitWitnessTransferFromCall::SELECTOR,
        Permit2::transferFromCall::SELECTOR,
    ])
});

/// True when the calldata starts with a selector that always needs approval.
pub fn is_blocked_prefix(calldata: &[u8]) -> bool {
    calldata.len() >= 4 && BLOCKED_SELECTORS.contains(&[calldata[0], calldata[1], calldata[2], calldata[3]])
}

/// Saturating u256 → u64 narrowing. High bytes set means the amount is far
/// beyond any spending cap, so `u64::MAX` keeps every limit check triggered.
pub fn sat_u64(value: U256) -> u64 {
    value.try_into().unwrap_or(u64::MAX)
}

/// Decodes intent calldata. Pure and deterministic.
pub fn decode(
    calldata: &Bytes,
    target: Address,
    value: u64,
    chain_id: u64,
    stablecoins: &StablecoinRegistry,
) -> DecodedCall {
    if calldata.is_empty() {
        return DecodedCall {
            action: CallAction::NativeTransfer { to: target, amount: value },
            summary: format!(
                "Transfer {} ETH to {}",
                format_eth(value),
                shorten(&target.to_string())
            ),
            selector: None,
            is_known: true,
        };
    }
    if calldata.len() < 4 {
        return unknown(calldata, "Calldata shorter than a selector");
    }
    let selector = [calldata[0], calldata[1], calldata[2], calldata[3]];

    match selector {
        s if s == Erc20::transferCall::SELECTOR => {
            let Ok(call) = Erc20::transferCall::abi_decode(calldata) else {
                return unknown(calldata, "Malformed transfer calldata");
            };
            let amount = sat_u64(call.amount);
            if let Some(decimals) = stablecoins.decimals(chain_id, target) {
                let display = if decimals == 6 {
                    format_stable(amount)
                } else {
                    amount.to_string()
                };
                DecodedCall {
                    action: CallAction::StableTransfer { token: target, to: call.to, amount },
                    summary: format!(
                        "Transfer {display} USDC to {}",
                        shorten(&call.to.to_string())
                    ),
                    selector: Some(selector.into()),
                    is_known: true,
                }
            } else {
                DecodedCall {
                    action: CallAction::TokenTransfer { token: target, to: call.to, amount },
                    summary: format!(
                        "Transfer {amount} units of token {} to {}",
                        shorten(&target.to_string()),
                        shorten(&call.to.to_string())
                    ),
                    selector: Some(selector.into()),
                    is_known: true,
                }
            }
        }
        s if s == Erc20::transferFromCall::SELECTOR => {
            let Ok(call) = Erc20::transferFromCall::abi_decode(calldata) else {
                return unknown(calldata, "Malformed transferFrom calldata");
            };
            DecodedCall {
                action: CallAction::TokenTransferFrom {
                    token: target,
                    from: call.from,
                    to: call.to,
                    amount: sat_u64(call.amount),
                },
                summary: format!(
                    "TransferFrom on token {} ({} -> {})",
                    shorten(&target.to_string()),
                    shorten(&call.from.to_string()),
                    shorten(&call.to.to_string())
                ),
                selector: Some(selector.into()),
                is_known: true,
            }
        }
        s if s == Erc20::approveCall::SELECTOR => allowance(target, selector, "approve"),
        s if s == Erc20::increaseAllowanceCall::SELECTOR => {
            allowance(target, selector, "increaseAllowance")
        }
        s if s == Erc20::decreaseAllowanceCall::SELECTOR => {
            allowance(target, selector, "decreaseAllowance")
        }
        s if s == Erc20::setApprovalForAllCall::SELECTOR => {
            allowance(target, selector, "setApprovalForAll")
        }
        s if s == Erc20::permitCall::SELECTOR => DecodedCall {
            action: CallAction::PermitSignature { token: target, kind: "permit" },
            summary: format!("Permit on token {}", shorten(&target.to_string())),
            selector: Some(selector.into()),
            is_known: true,
        },
        s if s == DaiLike::permitCall::SELECTOR => DecodedCall {
            action: CallAction::PermitSignature { token: target, kind: "permit (DAI)" },
            summary: format!("DAI-style permit on token {}", shorten(&target.to_string())),
            selector: Some(selector.into()),
            is_known: true,
        },
        s if s == Permit2::approveCall::SELECTOR => permit2(selector, "approve"),
        s if s == Permit2::permit_0Call::SELECTOR => permit2(selector, "permit"),
        s if s == Permit2::permit_1Call::SELECTOR => permit2(selector, "permitBatch"),
        s if s == Permit2::permitTransferFromCall::SELECTOR => {
            permit2(selector, "permitTransferFrom")
        }
        s if s == Permit2::permitWitnessTransferFromCall::SELECTOR => {
            permit2(selector, "permitWitnessTransferFrom")
        }
        s if s == Permit2::transferFromCall::SELECTOR => permit2(selector, "transferFrom"),
        s if s == UniversalRouter::execute_0Call::SELECTOR
            || s == UniversalRouter::execute_1Call::SELECTOR =>
        {
            match extract_swap_params(calldata) {
                Ok(params) => {
                    let summary = format!(
                        "Swap {} of {} for at least {} of {} via Universal Router",
                        params.amount_in,
                        shorten(&params.token_in.to_string()),
                        params.amount_out_min,
                        shorten(&params.token_out.to_string()),
                    );
                    DecodedCall {
                        action: CallAction::Swap(params),
                        summary,
                        selector: Some(selector.into()),
                        is_known: true,
                    }
                }
                Err(reason) => unknown(calldata, &format!("Unrecognized router commands: {reason}")),
            }
        }
        s if s == AavePool::supplyCall::SELECTOR => {
            let Ok(call) = AavePool::supplyCall::abi_decode(calldata) else {
                return unknown(calldata, "Malformed Aave supply calldata");
            };
            DecodedCall {
                action: CallAction::AaveSupply {
                    pool: target,
                    asset: call.asset,
                    amount: sat_u64(call.amount),
                },
                summary: format!("Supply {} of {} to Aave", sat_u64(call.amount), shorten(&call.asset.to_string())),
                selector: Some(selector.into()),
                is_known: true,
            }
        }
        s if s == AavePool::depositCall::SELECTOR => {
            let Ok(call) = AavePool::depositCall::abi_decode(calldata) else {
                return unknown(calldata, "Malformed Aave deposit calldata");
            };
            DecodedCall {
                action: CallAction::AaveSupply {
                    pool: target,
                    asset: call.asset,
                    amount: sat_u64(call.amount),
                },
                summary: format!("Deposit {} of {} to Aave", sat_u64(call.amount), shorten(&call.asset.to_string())),
                selector: Some(selector.into()),
                is_known: true,
            }
        }
        s if s == AavePool::withdrawCall::SELECTOR => {
            let Ok(call) = AavePool::withdrawCall::abi_decode(calldata) else {
                return unknown(calldata, "Malformed Aave withdraw calldata");
            };
            DecodedCall {
                action: CallAction::AaveWithdraw {
                    pool: target,
                    asset: call.asset,
                    amount: sat_u64(call.amount),
                },
                summary: format!("Withdraw {} of {} from Aave", sat_u64(call.amount), shorten(&call.asset.to_string())),
                selector: Some(selector.into()),
                is_known: true,
            }
        }
        s if s == Lido::submitCall::SELECTOR => DecodedCall {
            action: CallAction::LidoStake { amount: value },
            summary: format!("Stake {} ETH with Lido", format_eth(value)),
            selector: Some(selector.into()),
            is_known: true,
        },
        s if s == RocketDepositPool::depositCall::SELECTOR => DecodedCall {
            action: CallAction::RocketDeposit { amount: value },
            summary: format!("Deposit {} ETH to Rocket Pool", format_eth(value)),
            selector: Some(selector.into()),
            is_known: true,
        },
        _ => unknown(calldata, "Unknown selector"),
    }
}

fn allowance(token: Address, selector: [u8; 4], kind: &'static str) -> DecodedCall {
    DecodedCall {
        action: CallAction::AllowanceChange { token, kind },
        summary: format!("{kind} on token {}", shorten(&token.to_string())),
        selector: Some(selector.into()),
        is_known: true,
    }
}

fn permit2(selector: [u8; 4], kind: &'static str) -> DecodedCall {
    DecodedCall {
        action: CallAction::Permit2Action { kind },
        summary: format!("Permit2 {kind}"),
        selector: Some(selector.into()),
        is_known: true,
    }
}

fn unknown(calldata: &Bytes, summary: &str) -> DecodedCall {
    let selector = (calldata.len() >= 4)
        .then(|| FixedBytes::from([calldata[0], calldata[1], calldata[2], calldata[3]]));
    DecodedCall {
        action: CallAction::Unknown,
        summary: summary.to_string(),
        selector,
        is_known: false,
    }
}

/// Recovers exact-input swap parameters from a Universal Router `execute`.
///
/// Exactly one `V3_SWAP_EXACT_IN` command must be present; every structural
/// violation is an error, which the caller surfaces as undecodable.
pub fn extract_swap_params(calldata: &Bytes) -> Result<SwapParams, String> {
    let (commands, inputs) = decode_execute(calldata)?;
    if commands.len() != inputs.len() {
        return Err("command and input counts differ".into());
    }

    let mut swap: Option<(usize, u8)> = None;
    for (i, byte) in commands.iter().enumerate() {
        if byte & COMMAND_MASK == V3_SWAP_EXACT_IN {
            if swap.is_some() {
                return Err("more than one swap command".into());
            }
            swap = Some((i, *byte));
        }
    }
    let Some((index, _)) = swap else {
        return Err("no exact-input swap command".into());
    };

    let (recipient, amount_in, amount_out_min, path, payer_is_user) =
        <(Address, U256, U256, Bytes, bool)>::abi_decode_params(&inputs[index])
            .map_err(|e| format!("swap input: {e}"))?;

    if path.len() < SINGLE_HOP_PATH_LEN || (path.len() - 20) % HOP_LEN != 0 {
        return Err("malformed v3 path".into());
    }
    let token_in = Address::from_slice(&path[..20]);
    let token_out = Address::from_slice(&path[path.len() - 20..]);
    let fee = u32::from_be_bytes([0, path[20], path[21], path[22]]);
    let is_multi_hop = path.len() > SINGLE_HOP_PATH_LEN;

    Ok(SwapParams {
        amount_in: sat_u64(amount_in),
        amount_out_min: sat_u64(amount_out_min),
        token_in,
        token_out,
        fee,
        is_multi_hop,
        recipient,
        payer_is_user,
        commands: commands.clone(),
    })
}

fn decode_execute(calldata: &Bytes) -> Result<(Bytes, Vec<Bytes>), String> {
    if calldata.len() < 4 {
        return Err("too short".into());
    }
    let selector = [calldata[0], calldata[1], calldata[2], calldata[3]];
    if selector == UniversalRouter::execute_0Call::SELECTOR {
        let call = UniversalRouter::execute_0Call::abi_decode(calldata)
            .map_err(|e| format!("execute: {e}"))?;
        Ok((call.commands, call.inputs))
    } else if selector == UniversalRouter::execute_1Call::SELECTOR {
        let call = UniversalRouter::execute_1Call::abi_decode(calldata)
            .map_err(|e| format!("execute: {e}"))?;
        Ok((call.commands, call.inputs))
    } else {
        Err("not a router execute".into())
    }
}

/// Encodes the single-hop v3 path `token_in ‖ fee ‖ token_out`.
#[cfg(test)]
pub fn encode_v3_path(token_in: Address, fee: u32, token_out: Address) -> Bytes {
    let mut path = Vec::with_capacity(SINGLE_HOP_PATH_LEN);
    path.extend_from_slice(token_in.as_slice());
    path.extend_from_slice(&fee.to_be_bytes()[1..]);
    path.extend_from_slice(token_out.as_slice());
    path.into()
}
