//! # pixvault server
//!
//! Process entry point. One binary, three roles:
//!
//! - `serve`: HTTP API; resolves photos and publishes search tasks.
//! - `worker`: consumes search tasks and ingests the results.
//! - `all`: both in one process, sharing one admission gate.
//!
//! `db migrate` and `db preflight` manage the schema and exit.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use pixvault_core::{MIGRATOR, worker::Worker};
use pixvault_server::{
    create_app,
    infra::{
        app_state::AppState,
        bootstrap,
        config::{Config, ConfigLoad, ConfigLoader},
        telemetry,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "pixvault-server")]
#[command(about = "Photo ingestion service: HTTP API and queue worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT", global = true)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST", global = true)]
    host: Option<String>,

    /// Configuration file (defaults to pixvault.toml or config/pixvault.toml)
    #[arg(long, env = "PIXVAULT_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Run the queue consumer only
    Worker,
    /// Run the HTTP API and the queue consumer in one process
    All,
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum DbCommand {
    /// Check connectivity and report pending migrations, then exit
    Preflight,
    /// Apply database migrations and exit
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    Worker,
    All,
}

impl Mode {
    fn runs_http(self) -> bool {
        matches!(self, Mode::Serve | Mode::All)
    }

    fn runs_worker(self) -> bool {
        matches!(self, Mode::Worker | Mode::All)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.serve)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run(config, Mode::Serve).await,
        Command::Worker => run(config, Mode::Worker).await,
        Command::All => run(config, Mode::All).await,
        Command::Db(DbCommand::Preflight) => run_db_preflight(&config).await,
        Command::Db(DbCommand::Migrate) => run_db_migrate(&config).await,
    }
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Arc<Config>> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path.clone());
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    telemetry::init_tracing();

    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    Ok(Arc::new(config))
}

async fn run_db_preflight(config: &Config) -> anyhow::Result<()> {
    let pool = bootstrap::connect(config).await?;
    let pending = bootstrap::preflight(&pool)
        .await
        .context("database preflight failed")?;
    if pending == 0 {
        info!("database preflight passed; schema is up to date");
    } else {
        warn!(pending, "database preflight passed; migrations pending");
    }
    Ok(())
}

async fn run_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = bootstrap::connect(config).await?;
    MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    info!("database migrations applied successfully");
    Ok(())
}

async fn run(config: Arc<Config>, mode: Mode) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let state = bootstrap::build_state(Arc::clone(&config), shutdown.clone())
        .await?;
    info!(?mode, "pixvault starting");

    let worker = mode.runs_worker().then(|| {
        let worker = Worker::new(
            state.queue.clone(),
            Arc::clone(&state.engine),
            state.gate.clone(),
            config.worker.clone(),
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let outcome = worker.run(shutdown.clone()).await;
            // A worker that stops on its own takes the process down with it.
            shutdown.cancel();
            outcome
        })
    });

    let served = if mode.runs_http() {
        serve_http(state, shutdown.clone()).await
    } else {
        Ok(())
    };
    shutdown.cancel();

    if let Some(handle) = worker {
        let summary = handle
            .await
            .context("worker task panicked")?
            .context("worker stopped with an error")?;
        info!(
            acked = summary.acked,
            requeued = summary.requeued,
            released = summary.released,
            dead_lettered = summary.dead_lettered,
            poisoned = summary.poisoned,
            "worker finished"
        );
    }

    served
}

async fn serve_http(
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let host = state.config().server.host.clone();
    let port = state.config().server.port;
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    let addr = listener.local_addr()?;
    info!("starting pixvault HTTP server on {}", addr);

    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received; shutting down"),
        _ = terminate => info!("SIGTERM received; shutting down"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
