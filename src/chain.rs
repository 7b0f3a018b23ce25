//! Chain-side JSON-RPC.
//!
//! One [`AlloyChain`] exists per configured chain, built from the static
//! [`ChainTarget`] table (public RPC, bundler endpoint, QuoterV2 and WETH
//! deployments). Everything the daemon reads on-chain flows through the
//! [`ChainRpc`] trait so the policy engine and the userop builder can be
//! exercised against fakes.

use alloy_primitives::{address, Address, Bytes, TxKind, B256, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{TransactionInput, TransactionRequest};
use alloy_sol_types::sol;
use std::time::Duration;
use url::Url;

/// ERC-4337 EntryPoint v0.7 singleton.
pub const ENTRY_POINT_V07: Address = address!("0x0000000071727de22e5e9d8baf0edac6f37da032");

/// RIP-7212 P-256 verification precompile.
pub const P256_VERIFY_PRECOMPILE: Address =
    address!("0x0000000000000000000000000000000000000100");

const RPC_DEADLINE: Duration = Duration::from_secs(10);

sol! {
    #[sol(rpc)]
    interface IEntryPoint {
        function getNonce(address sender, uint192 key) external view returns (uint256 nonce);
    }

    /// The smart wallet the daemon signs for. `execute` is the outer call of
    /// every UserOperation; `frozen`/`freeze` back the freeze lifecycle.
    #[sol(rpc)]
    interface IWardWallet {
        function execute(address target, uint256 value, bytes calldata data) external;
        function frozen() external view returns (bool);
        function freeze() external;
    }

    #[sol(rpc)]
    interface IAccountFactory {
        function getAddress(bytes32 pubKeyX, bytes32 pubKeyY, uint256 salt) external view returns (address account);
        function createAccount(bytes32 pubKeyX, bytes32 pubKeyY, uint256 salt) external returns (address account);
    }

    #[sol(rpc)]
    interface IQuoterV2 {
        struct QuoteExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint256 amountIn;
            uint24 fee;
            uint160 sqrtPriceLimitX96;
        }
        function quoteExactInputSingle(QuoteExactInputSingleParams memory params)
            external
            returns (uint256 amountOut, uint160 sqrtPriceX96After, uint32 initializedTicksCrossed, uint256 gasEstimate);
    }
}

/// Static per-chain deployment and endpoint table.
#[derive(Debug, Clone)]
pub struct ChainTarget {
    pub chain_id: u64,
    pub name: &'static str,
    pub rpc_url: &'static str,
    pub bundler_url: &'static str,
    pub quoter: Option<Address>,
    pub weth: Address,
}

pub static CHAIN_TARGETS: &[ChainTarget] = &[
    ChainTarget {
        chain_id: 1,
        name: "ethereum",
        rpc_url: "https://ethereum-rpc.publicnode.com",
        bundler_url: "https://public.pimlico.io/v2/1/rpc",
        quoter: Some(address!("0x61ffe014ba17989e743c5f6cb21bf9697530b21e")),
        weth: address!("0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"),
    },
    ChainTarget {
        chain_id: 8453,
        name: "base",
        rpc_url: "https://mainnet.base.org",
        bundler_url: "https://public.pimlico.io/v2/8453/rpc",
        quoter: Some(address!("0x3d4e44eb1374240ce5f1b871ab261cd16335b76a")),
        weth: address!("0x4200000000000000000000000000000000000006"),
    },
];

pub fn chain_target(chain_id: u64) -> Option<&'static ChainTarget> {
    CHAIN_TARGETS.iter().find(|t| t.chain_id == chain_id)
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("unsupported chain id {0}")]
    UnsupportedChain(u64),
    #[error("invalid RPC url: {0}")]
    InvalidUrl(String),
    #[error("RPC deadline exceeded")]
    Timeout,
    #[error("chain RPC: {0}")]
    Rpc(String),
}

/// Read-side chain operations. All u256→u64 narrowings saturate.
#[async_trait::async_trait]
pub trait ChainRpc: Send + Sync {
    fn chain_id(&self) -> u64;

    /// QuoterV2 deployment on this chain, when one exists.
    fn quoter(&self) -> Option<Address>;

    /// Canonical wrapped-ETH deployment on this chain.
    fn weth(&self) -> Address;

    async fn balance(&self, addr: Address) -> Result<U256, ChainError>;
    async fn gas_price(&self) -> Result<u128, ChainError>;
    async fn transaction_count(&self, addr: Address) -> Result<u64, ChainError>;
    async fn code_at(&self, addr: Address) -> Result<Bytes, ChainError>;

    /// `EntryPoint.getNonce(sender, 0)`.
    async fn entry_point_nonce(
        &self,
        entry_point: Address,
        sender: Address,
    ) -> Result<U256, ChainError>;

    /// The wallet's `frozen()` view.
    async fn wallet_frozen(&self, wallet: Address) -> Result<bool, ChainError>;

    /// The factory's counterfactual address for a P-256 owner key.
    async fn counterfactual_address(
        &self,
        factory: Address,
        x: B256,
        y: B256,
        salt: U256,
    ) -> Result<Address, ChainError>;

    async fn quote_exact_input_single(
        &self,
        quoter: Address,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        fee: u32,
    ) -> Result<U256, ChainError>;

    /// Raw `eth_call`, used by the precompile probe.
    async fn call_raw(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError>;
}

/// [`ChainRpc`] over an alloy HTTP provider.
#[derive(Debug)]
pub struct AlloyChain {
    chain_id: u64,
    quoter: Option<Address>,
    weth: Address,
    provider: DynProvider,
}

impl AlloyChain {
    /// Connects to `chain_id` using the static table, with an optional RPC
    /// URL override from configuration.
    pub fn connect(chain_id: u64, rpc_override: Option<&Url>) -> Result<Self, ChainError> {
        let target = chain_target(chain_id).ok_or(ChainError::UnsupportedChain(chain_id))?;
        let url: Url = match rpc_override {
            Some(u) => u.clone(),
            None => target
                .rpc_url
                .parse()
                .map_err(|e| ChainError::InvalidUrl(format!("{e}")))?,
        };
        let provider = ProviderBuilder::new().connect_http(url);
        Ok(Self {
            chain_id,
            quoter: target.quoter,
            weth: target.weth,
            provider: DynProvider::new(provider),
        })
    }

    async fn with_deadline<T, F>(fut: F) -> Result<T, ChainError>
    where
        F: std::future::Future<Output = Result<T, ChainError>>,
    {
        tokio::time::timeout(RPC_DEADLINE, fut)
            .await
            .map_err(|_| ChainError::Timeout)?
    }
}

#[async_trait::async_trait]
impl ChainRpc for AlloyChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn quoter(&self) -> Option<Address> {
        self.quoter
    }

    fn weth(&self) -> Address {
        self.weth
    }

    async fn balance(&self, addr: Address) -> Result<U256, ChainError> {
        Self::with_deadline(async {
            self.provider
                .get_balance(addr)
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        Self::with_deadline(async {
            self.provider
                .get_gas_price()
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
    }

    async fn transaction_count(&self, addr: Address) -> Result<u64, ChainError> {
        Self::with_deadline(async {
            self.provider
                .get_transaction_count(addr)
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
    }

    async fn code_at(&self, addr: Address) -> Result<Bytes, ChainError> {
        Self::with_deadline(async {
            self.provider
                .get_code_at(addr)
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
    }

    async fn entry_point_nonce(
        &self,
        entry_point: Address,
        sender: Address,
    ) -> Result<U256, ChainError> {
        Self::with_deadline(async {
            let ep = IEntryPoint::new(entry_point, &self.provider);
            ep.getNonce(sender, alloy_primitives::Uint::<192, 3>::ZERO)
                .call()
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
    }

    async fn wallet_frozen(&self, wallet: Address) -> Result<bool, ChainError> {
        Self::with_deadline(async {
            let w = IWardWallet::new(wallet, &self.provider);
            w.frozen()
                .call()
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
    }

    async fn counterfactual_address(
        &self,
        factory: Address,
        x: B256,
        y: B256,
        salt: U256,
    ) -> Result<Address, ChainError> {
        Self::with_deadline(async {
            let f = IAccountFactory::new(factory, &self.provider);
            f.getAddress(x, y, salt)
                .call()
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
    }

    async fn quote_exact_input_single(
        &self,
        quoter: Address,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        fee: u32,
    ) -> Result<U256, ChainError> {
        Self::with_deadline(async {
            let q = IQuoterV2::new(quoter, &self.provider);
            let params = IQuoterV2::QuoteExactInputSingleParams {
                tokenIn: token_in,
                tokenOut: token_out,
                amountIn: amount_in,
                fee: alloy_primitives::Uint::<24, 1>::from(fee),
                sqrtPriceLimitX96: alloy_primitives::Uint::<160, 3>::ZERO,
            };
            let out = q
                .quoteExactInputSingle(params)
                .call()
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))?;
            Ok(out.amountOut)
        })
        .await
    }

    async fn call_raw(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        Self::with_deadline(async {
            let tx = TransactionRequest {
                to: Some(TxKind::Call(to)),
                input: TransactionInput::new(data),
                ..Default::default()
            };
            self.provider
                .call(tx)
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_table_covers_home_chains() {
        let mainnet = chain_target(1).unwrap();
        assert!(mainnet.quoter.is_some());
        let base = chain_target(8453).unwrap();
        assert_eq!(base.name, "base");
        assert!(chain_target(42).is_none());
    }

    #[test]
    fn connect_rejects_unknown_chain() {
        let err = AlloyChain::connect(31337, None).unwrap_err();
        assert!(matches!(err, ChainError::UnsupportedChain(31337)));
    }
}
