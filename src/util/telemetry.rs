use std::env;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Tracing setup for the daemon.
///
/// Installs a `tracing-subscriber` fmt layer filtered by `RUST_LOG` (default
/// `info`). The daemon writes human-readable logs to stderr; the structured
/// audit trail lives in [`crate::audit`], not here.
pub struct Telemetry {
    name: &'static str,
    version: &'static str,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = version;
        self
    }

    /// Registers the global subscriber. Call once, early in `main`.
    pub fn register(self) -> Self {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
        tracing::info!(name = self.name, version = self.version, "tracing initialized");
        self
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
