//! Grid Arbiter
//!
//! Long-running service that owns the Grid Server fleet.
//!
//! Startup:
//! - Configuration: `GRID_*` environment variables, overridden by flags
//! - Wiring: port allocator, deployer, instance provider, job manager
//! - Job manager start: version read, recovery of running instances, maintenance loops
//! - Admin API on the bind address, operator console on stdin
//!
//! Ctrl-C cancels the maintenance loops and stops the HTTP server.

use anyhow::{Context, Result};
use clap::Parser;
use grid_arbiter::api::{self, AppState};
use grid_arbiter::config::{ArbiterConfig, DeploymentMode};
use grid_arbiter::console::{self, ConsoleContext};
use grid_core::metrics::{CounterRegistry, InMemoryCounterRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "grid-arbiter")]
#[command(about = "Arbitrates jobs over a fleet of Grid Servers", long_about = None)]
struct Cli {
    /// Deployment mode: process or container
    #[arg(long, env = "GRID_MODE")]
    mode: Option<DeploymentMode>,

    /// Grid Server executable (process mode)
    #[arg(long, env = "GRID_EXECUTABLE_PATH")]
    executable: Option<PathBuf>,

    /// Admin API bind address
    #[arg(long, env = "GRID_BIND_ADDRESS")]
    bind: Option<SocketAddr>,

    /// Do not read operator commands from stdin
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grid_arbiter=info,grid_client=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("Starting Grid Arbiter");

    let config = load_config(&cli)?;
    info!(
        "Loaded configuration: mode={:?}, ports={:?}, bind={}",
        config.mode, config.port_range, config.bind_address
    );

    let counters: Arc<dyn CounterRegistry> = Arc::new(InMemoryCounterRegistry::new());
    let arbiter = grid_arbiter::build(&config, counters).context("Failed to build arbiter")?;

    let token = CancellationToken::new();
    spawn_shutdown_listener(token.clone());

    let loops = arbiter.jobs.start(token.clone()).await;
    info!(
        "Job manager started: version '{}', {} ready instance(s), {} active job(s)",
        arbiter.jobs.version(),
        arbiter.jobs.get_ready_instance_count(),
        arbiter.jobs.get_active_jobs_count()
    );

    if !cli.no_console {
        spawn_console(
            ConsoleContext {
                jobs: arbiter.jobs.clone(),
                ports: arbiter.ports.clone(),
            },
            token.clone(),
        );
    }

    let app = api::create_router(Arc::new(AppState {
        jobs: arbiter.jobs.clone(),
        counters: arbiter.counters.clone(),
    }));

    info!("Listening on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_address))?;

    let shutdown = token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    token.cancel();
    for handle in loops {
        if let Err(e) = handle.await {
            warn!("Background loop panicked: {}", e);
        }
    }

    info!("Grid Arbiter stopped");
    Ok(())
}

/// Loads configuration from the environment and applies flag overrides
fn load_config(cli: &Cli) -> Result<ArbiterConfig> {
    let mut config = ArbiterConfig::from_env().context("Failed to load configuration")?;

    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(executable) = &cli.executable {
        config.executable_path = executable.clone();
    }
    if let Some(bind) = cli.bind {
        config.bind_address = bind;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        token.cancel();
    });
}

/// Reads operator commands from stdin until shutdown or end of input
fn spawn_console(context: ConsoleContext, token: CancellationToken) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    if let Some(report) = console::dispatch(&context, &line) {
                        println!("{}", report);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Console input failed: {}", e);
                    break;
                }
            }
        }
    });
}
