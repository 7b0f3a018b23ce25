//! txwarden daemon entrypoint.
//!
//! Boot order: load `.env`, install tracing, open the key store, open the
//! signed configuration (safe mode on integrity failure), assemble the
//! service graph, probe the P-256 precompile, reconcile the on-chain frozen
//! flag, then serve the unix socket until SIGTERM/SIGINT.

use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::Arc;

use txwarden::daemon::{verify_signer_health, Daemon};
use txwarden::freeze;
use txwarden::oracle::{NullOracle, PresenceOracle, UiSocketOracle};
use txwarden::server::{run_server, SOCKET_FILE};
use txwarden::signer::SoftKeystore;
use txwarden::util::{SigDown, Telemetry};

/// CLI arguments for the signing daemon.
#[derive(Parser, Debug)]
#[command(name = "txwarden")]
#[command(about = "Policy-gated ERC-4337 signing daemon")]
struct CliArgs {
    /// Daemon state directory (config, keys, audit log, socket).
    #[arg(long, env = "TXWARDEN_DIR", default_value_os_t = default_dir())]
    dir: PathBuf,

    /// Socket path of the companion UI (human-presence oracle). Admin
    /// operations fail closed when unset.
    #[arg(long, env = "TXWARDEN_UI_SOCKET")]
    ui_socket: Option<PathBuf>,
}

fn default_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".txwarden")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let args = CliArgs::parse();

    let signer = Arc::new(SoftKeystore::load_or_generate(&args.dir)?);
    verify_signer_health(signer.as_ref()).await?;

    let oracle: Arc<dyn PresenceOracle> = match &args.ui_socket {
        Some(path) => Arc::new(UiSocketOracle::new(path.clone())),
        None => {
            tracing::warn!("no companion UI socket configured, admin operations will fail closed");
            Arc::new(NullOracle)
        }
    };

    let daemon = Daemon::bootstrap(
        &args.dir,
        signer,
        oracle,
        Daemon::production_connector(),
    )
    .await?;
    if daemon.config().is_safe_mode() {
        tracing::error!("configuration integrity not verified: serving read-only endpoints only");
    }

    match daemon.probe_precompile().await {
        Ok(available) => tracing::info!(available, "p256 precompile probed"),
        Err(e) => tracing::warn!(error = %e, "p256 precompile probe failed"),
    }
    {
        let graph = daemon.graph();
        match graph.bundler.supported_entry_points().await {
            Ok(entry_points) => {
                let configured = graph.builder.entry_point();
                if !entry_points.contains(&configured) {
                    tracing::warn!(
                        entry_point = %configured,
                        supported = ?entry_points,
                        "bundler does not advertise the configured entry point"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to query bundler entry points"),
        }
    }
    if let Err(e) = freeze::sync_once(&daemon.graph()).await {
        tracing::warn!(error = %e, "startup freeze sync failed");
    }

    let sig_down = SigDown::try_new()?;
    let cancel = sig_down.cancellation_token();

    let syncer = tokio::spawn(freeze::run_freeze_syncer(daemon.clone(), cancel.clone()));

    let socket_path = daemon.data_dir.join(SOCKET_FILE);
    run_server(socket_path, daemon, cancel).await?;

    syncer.abort();
    Ok(())
}
