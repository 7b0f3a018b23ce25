//! ERC-4337 v0.7 UserOperation construction and hashing.
//!
//! The builder composes the packed operation for the wallet's
//! `execute(address,uint256,bytes)` call, asks the bundler for gas, applies
//! the safety margins, and computes the hash the hardware key signs. The
//! paymaster field is empty everywhere; this daemon self-pays.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::{SolCall, SolValue};
use std::sync::Arc;

use crate::bundler::{BundlerError, BundlerRpc};
use crate::chain::{ChainError, ChainRpc, IWardWallet};

/// Fee floors: 0.1 gwei max fee, 0.01 gwei priority.
const MIN_MAX_FEE_WEI: u128 = 100_000_000;
const MIN_PRIORITY_FEE_WEI: u128 = 10_000_000;

/// Estimate floors before margins.
const MIN_VERIFICATION_GAS: u128 = 300_000;
const MIN_CALL_GAS: u128 = 50_000;
const MIN_PRE_VERIFICATION_GAS: u128 = 21_000;

/// Draft limits used for the estimate request itself.
const DRAFT_VERIFICATION_GAS: u128 = 1_000_000;
const DRAFT_CALL_GAS: u128 = 1_000_000;
const DRAFT_PRE_VERIFICATION_GAS: u128 = 100_000;

/// Submission buffer and the threshold for the opaque gas signal.
const GAS_COST_BUFFER_WEI: u128 = 1_000_000_000_000_000; // 0.001 ETH
const LOW_GAS_THRESHOLD_WEI: u128 = 5_000_000_000_000_000; // 0.005 ETH

/// A v0.7 packed UserOperation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedUserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    /// `verificationGasLimit ‖ callGasLimit`, each 16 bytes big-endian.
    pub account_gas_limits: B256,
    pub pre_verification_gas: U256,
    /// `maxPriorityFeePerGas ‖ maxFeePerGas`, each 16 bytes big-endian.
    pub gas_fees: B256,
    pub paymaster_and_data: Bytes,
    /// Raw `r‖s`, 64 bytes. Zeroed until signed.
    pub signature: Bytes,
}

impl PackedUserOperation {
    pub fn verification_gas_limit(&self) -> u128 {
        unpack_pair(self.account_gas_limits).0
    }

    pub fn call_gas_limit(&self) -> u128 {
        unpack_pair(self.account_gas_limits).1
    }

    pub fn max_priority_fee_per_gas(&self) -> u128 {
        unpack_pair(self.gas_fees).0
    }

    pub fn max_fee_per_gas(&self) -> u128 {
        unpack_pair(self.gas_fees).1
    }
}

/// Packs two u128s into the high and low 16 bytes of a word.
pub fn pack_pair(high: u128, low: u128) -> B256 {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&high.to_be_bytes());
    out[16..].copy_from_slice(&low.to_be_bytes());
    B256::from(out)
}

pub fn unpack_pair(word: B256) -> (u128, u128) {
    let bytes = word.0;
    let mut high = [0u8; 16];
    let mut low = [0u8; 16];
    high.copy_from_slice(&bytes[..16]);
    low.copy_from_slice(&bytes[16..]);
    (u128::from_be_bytes(high), u128::from_be_bytes(low))
}

/// Which userOpHash formula the deployed EntryPoint expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOpHashScheme {
    /// v0.7 reference EntryPoint: `keccak(abi.encode(keccak(packed), entryPoint, chainId))`.
    EntryPointV07,
    /// EIP-712 typed-data variant.
    Eip712,
}

const EIP712_DOMAIN_TYPEHASH: &[u8] =
    b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const PACKED_USEROP_TYPEHASH: &[u8] = b"PackedUserOperation(address sender,uint256 nonce,bytes initCode,bytes callData,bytes32 accountGasLimits,uint256 preVerificationGas,bytes32 gasFees,bytes32 paymasterAndData)";

/// Hash of the packed fields, shared by both schemes.
fn packed_fields_hash(op: &PackedUserOperation) -> B256 {
    keccak256(
        (
            op.sender,
            op.nonce,
            keccak256(&op.init_code),
            keccak256(&op.call_data),
            op.account_gas_limits,
            op.pre_verification_gas,
            op.gas_fees,
            keccak256(&op.paymaster_and_data),
        )
            .abi_encode(),
    )
}

/// The hash the wallet's validator verifies. Never includes the signature.
pub fn user_op_hash(
    op: &PackedUserOperation,
    entry_point: Address,
    chain_id: u64,
    scheme: UserOpHashScheme,
) -> B256 {
    match scheme {
        UserOpHashScheme::EntryPointV07 => {
            let inner = packed_fields_hash(op);
            keccak256((inner, entry_point, U256::from(chain_id)).abi_encode())
        }
        UserOpHashScheme::Eip712 => {
            let domain = keccak256(
                (
                    keccak256(EIP712_DOMAIN_TYPEHASH),
                    keccak256(b"ERC4337"),
                    keccak256(b"1"),
                    U256::from(chain_id),
                    entry_point,
                )
                    .abi_encode(),
            );
            let struct_hash = keccak256(
                (
                    keccak256(PACKED_USEROP_TYPEHASH),
                    op.sender,
                    op.nonce,
                    keccak256(&op.init_code),
                    keccak256(&op.call_data),
                    op.account_gas_limits,
                    op.pre_verification_gas,
                    op.gas_fees,
                    keccak256(&op.paymaster_and_data),
                )
                    .abi_encode(),
            );
            let mut preimage = Vec::with_capacity(66);
            preimage.extend_from_slice(&[0x19, 0x01]);
            preimage.extend_from_slice(domain.as_slice());
            preimage.extend_from_slice(struct_hash.as_slice());
            keccak256(&preimage)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("chain: {0}")]
    Chain(#[from] ChainError),
    #[error("bundler: {0}")]
    Bundler(#[from] BundlerError),
    #[error("paymaster data must be empty")]
    PaymasterPresent,
}

/// Not enough ETH on the wallet to self-pay the operation.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("insufficient gas balance: need {required} wei, have {available} wei (short {shortfall} wei)")]
pub struct GasShortfall {
    pub required: U256,
    pub available: U256,
    pub shortfall: U256,
}

/// Builds ready-to-sign operations for one `(chain, entry point)` pair.
pub struct UserOpBuilder {
    chain: Arc<dyn ChainRpc>,
    bundler: Arc<dyn BundlerRpc>,
    entry_point: Address,
    chain_id: u64,
    hash_scheme: UserOpHashScheme,
}

impl UserOpBuilder {
    pub fn new(
        chain: Arc<dyn ChainRpc>,
        bundler: Arc<dyn BundlerRpc>,
        entry_point: Address,
        hash_scheme: UserOpHashScheme,
    ) -> Self {
        let chain_id = chain.chain_id();
        Self {
            chain,
            bundler,
            entry_point,
            chain_id,
            hash_scheme,
        }
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    /// Composes a fully-populated operation and the hash to sign.
    ///
    /// The signature field is a 64-byte zero placeholder; the caller signs
    /// the returned hash and fills it in.
    pub async fn build(
        &self,
        sender: Address,
        target: Address,
        value: U256,
        calldata: Bytes,
        init_code: Option<Bytes>,
    ) -> Result<(PackedUserOperation, B256), BuildError> {
        let nonce = self.chain.entry_point_nonce(self.entry_point, sender).await?;

        let call_data = IWardWallet::executeCall {
            target,
            value,
            data: calldata,
        }
        .abi_encode();

        let gas_price = self.chain.gas_price().await?;
        let max_fee = (gas_price.saturating_mul(2)).max(MIN_MAX_FEE_WEI);
        let max_priority = (gas_price / 10).max(MIN_PRIORITY_FEE_WEI);

        let mut op = PackedUserOperation {
            sender,
            nonce,
            init_code: init_code.unwrap_or_default(),
            call_data: call_data.into(),
            account_gas_limits: pack_pair(DRAFT_VERIFICATION_GAS, DRAFT_CALL_GAS),
            pre_verification_gas: U256::from(DRAFT_PRE_VERIFICATION_GAS),
            gas_fees: pack_pair(max_priority, max_fee),
            paymaster_and_data: Bytes::new(),
            signature: Bytes::from(vec![0u8; 64]),
        };

        let estimate = self
            .bundler
            .estimate_user_operation_gas(&op, self.entry_point)
            .await?;
        let verification = estimate
            .verification_gas_limit
            .max(MIN_VERIFICATION_GAS)
            .saturating_mul(3)
            / 2;
        let call_gas = estimate.call_gas_limit.max(MIN_CALL_GAS).saturating_mul(6) / 5;
        let pre_verification = estimate
            .pre_verification_gas
            .max(MIN_PRE_VERIFICATION_GAS)
            .saturating_mul(6)
            / 5;
        op.account_gas_limits = pack_pair(verification, call_gas);
        op.pre_verification_gas = U256::from(pre_verification);

        if !op.paymaster_and_data.is_empty() {
            return Err(BuildError::PaymasterPresent);
        }

        let hash = user_op_hash(&op, self.entry_point, self.chain_id, self.hash_scheme);
        Ok((op, hash))
    }
}

/// Checks the wallet can self-pay `op` with a 0.001 ETH buffer.
pub fn preflight_gas(op: &PackedUserOperation, balance: U256) -> Result<(), GasShortfall> {
    let (verification, call_gas) = unpack_pair(op.account_gas_limits);
    let total_gas = op
        .pre_verification_gas
        .saturating_add(U256::from(verification))
        .saturating_add(U256::from(call_gas));
    let required = total_gas
        .saturating_mul(U256::from(op.max_fee_per_gas()))
        .saturating_add(U256::from(GAS_COST_BUFFER_WEI));
    if balance >= required {
        Ok(())
    } else {
        Err(GasShortfall {
            required,
            available: balance,
            shortfall: required - balance,
        })
    }
}

/// Opaque balance signal for `/capabilities`.
pub fn gas_signal(balance: U256) -> &'static str {
    if balance < U256::from(LOW_GAS_THRESHOLD_WEI) {
        "low"
    } else {
        "ok"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::GasEstimate;
    use alloy_primitives::address;

    const SENDER: Address = address!("0x0000000000000000000000000000000000001111");
    const TARGET: Address = address!("0x0000000000000000000000000000000000002222");
    const ENTRY: Address = address!("0x0000000071727de22e5e9d8baf0edac6f37da032");

    fn sample_op() -> PackedUserOperation {
        PackedUserOperation {
            sender: SENDER,
            nonce: U256::from(7u64),
            init_code: Bytes::new(),
            call_data: Bytes::from(vec![0xde, 0xad]),
            account_gas_limits: pack_pair(450_000, 60_000),
            pre_verification_gas: U256::from(25_200u64),
            gas_fees: pack_pair(10_000_000, 100_000_000),
            paymaster_and_data: Bytes::new(),
            signature: Bytes::from(vec![0u8; 64]),
        }
    }

    #[test]
    fn pack_unpack_round_trip() {
        let word = pack_pair(u128::MAX - 3, 42);
        assert_eq!(unpack_pair(word), (u128::MAX - 3, 42));
        let op = sample_op();
        assert_eq!(op.verification_gas_limit(), 450_000);
        assert_eq!(op.call_gas_limit(), 60_000);
        assert_eq!(op.max_priority_fee_per_gas(), 10_000_000);
        assert_eq!(op.max_fee_per_gas(), 100_000_000);
    }

    #[test]
    fn hash_is_deterministic_and_field_sensitive() {
        let op = sample_op();
        let h1 = user_op_hash(&op, ENTRY, 8453, UserOpHashScheme::EntryPointV07);
        let h2 = user_op_hash(&op, ENTRY, 8453, UserOpHashScheme::EntryPointV07);
        assert_eq!(h1, h2);

        let mut other = op.clone();
        other.nonce = U256::from(8u64);
        assert_ne!(
            h1,
            user_op_hash(&other, ENTRY, 8453, UserOpHashScheme::EntryPointV07)
        );

        // Chain id and entry point are both bound.
        assert_ne!(h1, user_op_hash(&op, ENTRY, 1, UserOpHashScheme::EntryPointV07));
        assert_ne!(
            h1,
            user_op_hash(&op, TARGET, 8453, UserOpHashScheme::EntryPointV07)
        );
    }

    #[test]
    fn hash_ignores_signature() {
        let op = sample_op();
        let h1 = user_op_hash(&op, ENTRY, 8453, UserOpHashScheme::EntryPointV07);
        let mut signed = op.clone();
        signed.signature = Bytes::from(vec![0xab; 64]);
        assert_eq!(
            h1,
            user_op_hash(&signed, ENTRY, 8453, UserOpHashScheme::EntryPointV07)
        );
    }

    #[test]
    fn eip712_scheme_differs_from_concat() {
        let op = sample_op();
        assert_ne!(
            user_op_hash(&op, ENTRY, 8453, UserOpHashScheme::EntryPointV07),
            user_op_hash(&op, ENTRY, 8453, UserOpHashScheme::Eip712)
        );
    }

    #[test]
    fn preflight_accepts_funded_wallet() {
        let op = sample_op();
        // total gas = 450k + 60k + 25.2k = 535_200; fee = 0.1 gwei
        let required = U256::from(535_200u64) * U256::from(100_000_000u64)
            + U256::from(GAS_COST_BUFFER_WEI);
        assert!(preflight_gas(&op, required).is_ok());
        let err = preflight_gas(&op, required - U256::from(1u64)).unwrap_err();
        assert_eq!(err.shortfall, U256::from(1u64));
        assert_eq!(err.required, required);
    }

    #[test]
    fn gas_signal_threshold() {
        assert_eq!(gas_signal(U256::from(4_999_999_999_999_999u64)), "low");
        assert_eq!(gas_signal(U256::from(5_000_000_000_000_000u64)), "ok");
    }

    mod builder {
        use super::*;
        use crate::chain::ChainError;

        struct FakeChain;

        #[async_trait::async_trait]
        impl ChainRpc for FakeChain {
            fn chain_id(&self) -> u64 {
                8453
            }
            fn quoter(&self) -> Option<Address> {
                None
            }
            fn weth(&self) -> Address {
                Address::ZERO
            }
            async fn balance(&self, _: Address) -> Result<U256, ChainError> {
                Ok(U256::MAX)
            }
            async fn gas_price(&self) -> Result<u128, ChainError> {
                Ok(1_000_000_000) // 1 gwei
            }
            async fn transaction_count(&self, _: Address) -> Result<u64, ChainError> {
                Ok(0)
            }
            async fn code_at(&self, _: Address) -> Result<Bytes, ChainError> {
                Ok(Bytes::new())
            }
            async fn entry_point_nonce(
                &self,
                _: Address,
                _: Address,
            ) -> Result<U256, ChainError> {
                Ok(U256::from(5u64))
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
                Ok(U256::ZERO)
            }
            async fn call_raw(&self, _: Address, _: Bytes) -> Result<Bytes, ChainError> {
                Ok(Bytes::new())
            }
        }

        struct FakeBundler;

        #[async_trait::async_trait]
        impl BundlerRpc for FakeBundler {
            async fn estimate_user_operation_gas(
                &self,
                _op: &PackedUserOperation,
                _entry_point: Address,
            ) -> Result<GasEstimate, BundlerError> {
                Ok(GasEstimate {
                    pre_verification_gas: 30_000,
                    verification_gas_limit: 200_000,
                    call_gas_limit: 80_000,
                })
            }
            async fn send_user_operation(
                &self,
                _op: &PackedUserOperation,
                _entry_point: Address,
            ) -> Result<B256, BundlerError> {
                Ok(B256::ZERO)
            }
            async fn supported_entry_points(&self) -> Result<Vec<Address>, BundlerError> {
                Ok(vec![ENTRY])
            }
        }

        #[tokio::test]
        async fn build_applies_floors_and_margins() {
            let builder = UserOpBuilder::new(
                Arc::new(FakeChain),
                Arc::new(FakeBundler),
                ENTRY,
                UserOpHashScheme::EntryPointV07,
            );
            let (op, hash) = builder
                .build(SENDER, TARGET, U256::from(1u64), Bytes::new(), None)
                .await
                .unwrap();

            assert_eq!(op.nonce, U256::from(5u64));
            // verification: max(200k, 300k) * 1.5 = 450k
            assert_eq!(op.verification_gas_limit(), 450_000);
            // call: max(80k, 50k) * 1.2 = 96k
            assert_eq!(op.call_gas_limit(), 96_000);
            // preVer: max(30k, 21k) * 1.2 = 36k
            assert_eq!(op.pre_verification_gas, U256::from(36_000u64));
            // fees: 2 * 1 gwei, 0.1 gwei priority
            assert_eq!(op.max_fee_per_gas(), 2_000_000_000);
            assert_eq!(op.max_priority_fee_per_gas(), 100_000_000);
            assert!(op.paymaster_and_data.is_empty());
            assert_eq!(op.signature.len(), 64);
            assert_eq!(
                hash,
                user_op_hash(&op, ENTRY, 8453, UserOpHashScheme::EntryPointV07)
            );
        }
    }
}
