//! Orbit gateway process entry point.
//!
//! # Usage
//!
//! ```bash
//! # Link by QR code, credentials under ./auth
//! orbit-gateway ./auth
//!
//! # Link by pairing code for a phone number
//! orbit-gateway ./auth 15550001111
//!
//! # Wipe stored credentials and exit
//! orbit-gateway ./auth --clear-state
//!
//! # Remote credential storage
//! ORBIT_AUTH_BACKEND=remote ORBIT_AUTH_URL=https://store.example \
//!     WHATSAPP_SESSION_ID=user-7 orbit-gateway ./auth
//! ```
//!
//! stdout carries the event stream only; logs go to stderr.
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown, no restart request

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use orbit_gateway::adapter::SubprocessAdapter;
use orbit_gateway::auth::{AuthState, build_store};
use orbit_gateway::ipc::{self, EVENT_BUFFER, EventSink};
use orbit_gateway::media::MediaStore;
use orbit_gateway::{ExitReason, GatewayConfig, Supervisor};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Blocking stdin reads can outlive the supervisor; don't wait on them long.
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(2);

/// Orbit gateway - one chat-network session bridged over stdio
#[derive(Parser, Debug)]
#[command(name = "orbit-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding session credentials
    #[arg(value_name = "AUTH_DIR")]
    auth_dir: PathBuf,

    /// Phone number for code-based linking (QR linking when omitted)
    #[arg(value_name = "PHONE")]
    phone: Option<String>,

    /// Wipe stored credentials and exit
    #[arg(long)]
    clear_state: bool,

    /// Configuration file path (YAML)
    #[arg(short = 'c', long, env = "ORBIT_GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "ORBIT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Session helper executable (overrides the config file)
    #[arg(long, env = "ORBIT_SESSION_HELPER", value_name = "CMD")]
    helper: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(args));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{:#}", e), "Gateway failed");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise the `--log-level` flag. Always to stderr.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("orbit_gateway={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

async fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    config
        .apply_env()
        .context("Invalid environment configuration")?;
    if let Some(helper) = &args.helper {
        config.adapter.command = helper.clone();
    }
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "Orbit gateway starting");

    let config = load_config(&args).await?;
    ensure_dir(&args.auth_dir).await?;
    let store = build_store(&config.auth, &args.auth_dir)
        .context("Failed to set up credential storage")?;

    if args.clear_state {
        store
            .clear()
            .await
            .context("Failed to clear credentials")?;
        info!(backend = store.backend(), "Credentials cleared");
        return Ok(());
    }

    let (auth, outcome) = AuthState::load(store).await;
    info!(outcome = ?outcome, registered = auth.is_registered(), "Credentials loaded");

    let media = MediaStore::new(config.media_dir(&args.auth_dir));
    let adapter = Arc::new(SubprocessAdapter::new(&config.adapter));

    let (events, events_rx) = EventSink::channel(EVENT_BUFFER);
    let writer = ipc::spawn_writer(events_rx, tokio::io::stdout());

    let supervisor = Supervisor::new(config, adapter, auth, media, events.clone(), args.phone);
    // Input EOF is logged only; the gateway keeps serving until told to stop.
    let reader = ipc::spawn_reader(tokio::io::stdin(), supervisor.queue(), events.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = supervisor.run(shutdown).await;

    // The reader holds a sink; once it and ours are gone the writer drains.
    reader.abort();
    drop(events);
    if let Err(e) = writer.await {
        warn!(error = %e, "Event writer panicked");
    }

    match result.context("Failed to start session")? {
        ExitReason::Shutdown => info!("Gateway stopped cleanly"),
        ExitReason::Restart { reason } => info!(reason = %reason, "Exiting for restart"),
    }
    Ok(())
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create auth directory {}", dir.display()))
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                wait_for_interrupt().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = wait_for_interrupt() => {}
        }
    }

    #[cfg(not(unix))]
    wait_for_interrupt().await;

    shutdown.cancel();
}

/// Resolves on SIGINT. Never resolves if the handler cannot be installed.
async fn wait_for_interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT, shutting down"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    }
}
