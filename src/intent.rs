//! The intent surface accepted from the agent.
//!
//! An intent is the *only* influence the agent has on a transaction:
//! destination, calldata, value, and an optional chain hint. Anything else in
//! the request body — nonces, gas fields, signatures, whatever the agent
//! dreamt up — is logged and discarded so it can never steer the built
//! UserOperation.

use alloy_primitives::{Address, Bytes, U256};
use serde::Deserialize;
use std::str::FromStr;

/// Parsed, validated intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub target: Address,
    pub calldata: Bytes,
    /// Value in wei. Bounded to `u64` at the edge (~18.4 ETH), far above any
    /// profile cap; larger values are rejected, not saturated, because a
    /// request that large is never legitimate.
    pub value: u64,
    pub chain_hint: Option<u64>,
}

/// A `/sign` request body: an intent plus an optional approval code from a
/// retried request.
#[derive(Debug, Clone)]
pub struct IntentEnvelope {
    pub intent: Intent,
    pub approval_code: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("request body is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid `target` address: {0}")]
    BadTarget(String),
    #[error("invalid `calldata` hex: {0}")]
    BadCalldata(String),
    #[error("invalid `value`: {0}")]
    BadValue(String),
    #[error("`value` does not fit in 64 bits")]
    ValueTooLarge,
    #[error("invalid `chainHint`: {0}")]
    BadChainHint(String),
}

#[derive(Deserialize)]
struct IntentWire {
    target: String,
    calldata: String,
    value: String,
    #[serde(rename = "chainHint")]
    chain_hint: Option<String>,
    #[serde(rename = "approvalCode")]
    approval_code: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl IntentEnvelope {
    /// Parses a request body. Unknown fields are logged and dropped.
    pub fn parse(body: &serde_json::Value) -> Result<Self, IntentError> {
        if !body.is_object() {
            return Err(IntentError::NotAnObject);
        }
        let wire: IntentWire = serde_json::from_value(body.clone()).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("target") {
                IntentError::MissingField("target")
            } else if msg.contains("calldata") {
                IntentError::MissingField("calldata")
            } else if msg.contains("value") {
                IntentError::MissingField("value")
            } else {
                IntentError::NotAnObject
            }
        })?;

        if !wire.extra.is_empty() {
            let keys: Vec<&str> = wire.extra.keys().map(String::as_str).collect();
            tracing::warn!(fields = ?keys, "discarding unknown intent fields");
        }

        let target = Address::from_str(&wire.target)
            .map_err(|e| IntentError::BadTarget(e.to_string()))?;
        let calldata = Bytes::from_str(&wire.calldata)
            .map_err(|e| IntentError::BadCalldata(e.to_string()))?;

        let value_u256 = match wire.value.strip_prefix("0x") {
            Some(hex) => U256::from_str_radix(hex, 16),
            None => U256::from_str_radix(&wire.value, 10),
        }
        .map_err(|e| IntentError::BadValue(e.to_string()))?;
        let value: u64 = value_u256
            .try_into()
            .map_err(|_| IntentError::ValueTooLarge)?;

        let chain_hint = wire
            .chain_hint
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|e| IntentError::BadChainHint(e.to_string()))
            })
            .transpose()?;

        Ok(Self {
            intent: Intent {
                target,
                calldata,
                value,
                chain_hint,
            },
            approval_code: wire.approval_code,
        })
    }
}

/// Formats wei as ETH with four decimal places, e.g. `0.0600`.
pub fn format_eth(wei: u64) -> String {
    let whole = wei / 1_000_000_000_000_000_000;
    let frac = (wei % 1_000_000_000_000_000_000) / 100_000_000_000_000;
    format!("{whole}.{frac:04}")
}

/// Formats a 6-decimal stablecoin amount, e.g. `100.50`.
pub fn format_stable(units: u64) -> String {
    let whole = units / 1_000_000;
    let frac = (units % 1_000_000) / 10_000;
    format!("{whole}.{frac:02}")
}
