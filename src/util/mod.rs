//! Small shared utilities: graceful shutdown, tracing setup, log redaction.

pub mod redact;
pub mod sig_down;
pub mod telemetry;

pub use redact::redact;
pub use sig_down::SigDown;
pub use telemetry::Telemetry;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
///
/// Clock reads funnel through here so state machines that care about time
/// (spending windows, approval expiry) can take `now` as a parameter in tests
/// and this at the call site.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Shortens an address-like string for human-facing output: `0x1234…cdef`.
pub fn shorten(s: &str) -> String {
    if s.len() <= 12 {
        return s.to_string();
    }
    format!("{}…{}", &s[..6], &s[s.len() - 4..])
}
