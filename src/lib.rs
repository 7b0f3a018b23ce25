//! txwarden: a policy-gated ERC-4337 signing daemon.
//!
//! An autonomous agent proposes *intents* — destination, calldata, value —
//! over a local unix socket; this daemon is the sole authority on whether an
//! on-chain action is produced. It decodes the calldata, runs a default-deny
//! policy (selector blocklist, stablecoin and protocol registries, spending
//! limits, slippage verification), routes anything doubtful to a human
//! approval code, and only then builds a v0.7 UserOperation, signs its hash
//! with a hardware-isolated P-256 key, and submits it to a bundler.
//!
//! Module map:
//! - [`intent`] — the accepted request surface
//! - [`decode`] — calldata recognition and the selector blocklist
//! - [`policy`], [`spending`], [`registry`] — the default-deny engine
//! - [`approval`] — 8-digit human approval codes
//! - [`userop`], [`bundler`], [`chain`] — ERC-4337 plumbing
//! - [`signer`] — the two-key hardware signer seam
//! - [`config`] — persisted, integrity-signed configuration
//! - [`freeze`] — the freeze/unfreeze lifecycle and on-chain mirror
//! - [`server`], [`handlers`] — the unix-socket protocol
//! - [`oracle`] — the human-presence (confirm + biometric) client
//! - [`audit`] — the redacted append-only trail
//! - [`daemon`] — service graph assembly and atomic reconfiguration

pub mod approval;
pub mod audit;
pub mod bundler;
pub mod chain;
pub mod config;
pub mod daemon;
pub mod decode;
pub mod freeze;
pub mod handlers;
pub mod intent;
pub mod oracle;
pub mod policy;
pub mod registry;
pub mod server;
pub mod signer;
pub mod spending;
pub mod userop;
pub mod util;
