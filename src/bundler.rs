//! ERC-4337 bundler JSON-RPC client.
//!
//! Speaks the v0.7 bundler surface over HTTPS: `eth_sendUserOperation`,
//! `eth_estimateUserOperationGas`, `eth_supportedEntryPoints`. The client is
//! cheap to clone and shares a connection pool via `reqwest::Client`. HTTP
//! 429 responses are retried with exponential backoff (base 1 s, factor 2,
//! up to 5 attempts); every other transport or RPC error propagates.

use alloy_primitives::{hex, Address, B256, U256};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::userop::PackedUserOperation;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const HTTP_DEADLINE: Duration = Duration::from_secs(10);

/// Unpacked gas numbers from `eth_estimateUserOperationGas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasEstimate {
    pub pre_verification_gas: u128,
    pub verification_gas_limit: u128,
    pub call_gas_limit: u128,
}

#[derive(Debug, thiserror::Error)]
pub enum BundlerError {
    #[error("bundler transport: {0}")]
    Transport(String),
    #[error("bundler rate limited after {0} attempts")]
    RateLimited(u32),
    #[error("bundler HTTP {0}")]
    HttpStatus(u16),
    #[error("bundler RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("bundler response malformed: {0}")]
    Malformed(String),
}

/// Bundler operations used by the signing pipeline.
#[async_trait::async_trait]
pub trait BundlerRpc: Send + Sync {
    async fn estimate_user_operation_gas(
        &self,
        op: &PackedUserOperation,
        entry_point: Address,
    ) -> Result<GasEstimate, BundlerError>;

    /// Submits the signed operation; returns the userOpHash the bundler
    /// acknowledged.
    async fn send_user_operation(
        &self,
        op: &PackedUserOperation,
        entry_point: Address,
    ) -> Result<B256, BundlerError>;

    async fn supported_entry_points(&self) -> Result<Vec<Address>, BundlerError>;
}

/// [`BundlerRpc`] over HTTPS JSON-RPC.
#[derive(Clone)]
pub struct HttpBundler {
    url: Url,
    client: reqwest::Client,
    backoff_base: Duration,
    next_id: Arc<AtomicU64>,
}

impl HttpBundler {
    pub fn new(url: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_DEADLINE)
            .build()
            .unwrap_or_default();
        Self {
            url,
            client,
            backoff_base: BACKOFF_BASE,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Test seam: shrink the backoff delay.
    #[cfg(test)]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, BundlerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let mut delay = self.backoff_base;
        for attempt in 1..=MAX_ATTEMPTS {
            let response = self
                .client
                .post(self.url.clone())
                .json(&body)
                .send()
                .await
                .map_err(|e| BundlerError::Transport(e.to_string()))?;

            let status = response.status();
            if status.as_u16() == 429 {
                if attempt == MAX_ATTEMPTS {
                    return Err(BundlerError::RateLimited(MAX_ATTEMPTS));
                }
                tracing::warn!(method, attempt, delay = ?delay, "bundler rate limited, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
                continue;
            }
            if !status.is_success() {
                return Err(BundlerError::HttpStatus(status.as_u16()));
            }

            let envelope: Value = response
                .json()
                .await
                .map_err(|e| BundlerError::Malformed(e.to_string()))?;
            if let Some(error) = envelope.get("error") {
                return Err(BundlerError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                });
            }
            return envelope
                .get("result")
                .cloned()
                .ok_or_else(|| BundlerError::Malformed("missing result".into()));
        }
        Err(BundlerError::RateLimited(MAX_ATTEMPTS))
    }
}

/// v0.7 wire form: `initCode` split into `factory`/`factoryData`, gas limits
/// unpacked, no paymaster fields.
fn user_op_to_rpc(op: &PackedUserOperation) -> Value {
    let mut wire = json!({
        "sender": op.sender.to_string(),
        "nonce": hex_quantity_u256(op.nonce),
        "callData": format!("0x{}", hex::encode(&op.call_data)),
        "callGasLimit": hex_quantity(op.call_gas_limit()),
        "verificationGasLimit": hex_quantity(op.verification_gas_limit()),
        "preVerificationGas": hex_quantity_u256(op.pre_verification_gas),
        "maxFeePerGas": hex_quantity(op.max_fee_per_gas()),
        "maxPriorityFeePerGas": hex_quantity(op.max_priority_fee_per_gas()),
        "signature": format!("0x{}", hex::encode(&op.signature)),
    });
    if op.init_code.len() >= 20 {
        let factory = Address::from_slice(&op.init_code[..20]);
        wire["factory"] = json!(factory.to_string());
        wire["factoryData"] = json!(format!("0x{}", hex::encode(&op.init_code[20..])));
    }
    wire
}

fn hex_quantity(value: u128) -> String {
    format!("0x{value:x}")
}

fn hex_quantity_u256(value: U256) -> String {
    format!("0x{value:x}")
}

fn quantity_u128(value: &Value, field: &str) -> Result<u128, BundlerError> {
    match value.get(field) {
        Some(Value::String(s)) => {
            let stripped = s.trim_start_matches("0x");
            u128::from_str_radix(stripped, 16)
                .map_err(|e| BundlerError::Malformed(format!("{field}: {e}")))
        }
        Some(Value::Number(n)) => n
            .as_u64()
            .map(u128::from)
            .ok_or_else(|| BundlerError::Malformed(format!("{field}: not a u64"))),
        _ => Err(BundlerError::Malformed(format!("{field}: missing"))),
    }
}

#[async_trait::async_trait]
impl BundlerRpc for HttpBundler {
    async fn estimate_user_operation_gas(
        &self,
        op: &PackedUserOperation,
        entry_point: Address,
    ) -> Result<GasEstimate, BundlerError> {
        let result = self
            .rpc(
                "eth_estimateUserOperationGas",
                json!([user_op_to_rpc(op), entry_point.to_string()]),
            )
            .await?;
        Ok(GasEstimate {
            pre_verification_gas: quantity_u128(&result, "preVerificationGas")?,
            verification_gas_limit: quantity_u128(&result, "verificationGasLimit")?,
            call_gas_limit: quantity_u128(&result, "callGasLimit")?,
        })
    }

    async fn send_user_operation(
        &self,
        op: &PackedUserOperation,
        entry_point: Address,
    ) -> Result<B256, BundlerError> {
        let result = self
            .rpc(
                "eth_sendUserOperation",
                json!([user_op_to_rpc(op), entry_point.to_string()]),
            )
            .await?;
        let hash = result
            .as_str()
            .ok_or_else(|| BundlerError::Malformed("userOpHash is not a string".into()))?;
        B256::from_str(hash).map_err(|e| BundlerError::Malformed(e.to_string()))
    }

    async fn supported_entry_points(&self) -> Result<Vec<Address>, BundlerError> {
        let result = self.rpc("eth_supportedEntryPoints", json!([])).await?;
        let entries = result
            .as_array()
            .ok_or_else(|| BundlerError::Malformed("expected array".into()))?;
        entries
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| BundlerError::Malformed("entry point is not a string".into()))
                    .and_then(|s| {
                        Address::from_str(s).map_err(|e| BundlerError::Malformed(e.to_string()))
                    })
            })
            .collect()
    }
}
