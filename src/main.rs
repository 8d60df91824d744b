#![forbid(unsafe_code)]

//! `memory-worker`: observation queue worker binary.
//!
//! Loads configuration, recovers queued work from the previous run, and
//! serves the hook API until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use memory_worker::agents::response::ResponseProcessor;
use memory_worker::agents::{build_agent, AgentContext};
use memory_worker::config::GlobalConfig;
use memory_worker::http::{self, AppState};
use memory_worker::orchestrator::process_reaper::spawn_process_reaper;
use memory_worker::orchestrator::process_registry::ProcessRegistry;
use memory_worker::orchestrator::session_manager::SessionManager;
use memory_worker::persistence::observation_repo::ObservationRepo;
use memory_worker::persistence::pending_repo::PendingMessageStore;
use memory_worker::persistence::session_repo::SessionRepo;
use memory_worker::persistence::{db, sweep};
use memory_worker::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "memory-worker", about = "Observation queue worker", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("memory-worker bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Configuration ───────────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    config.load_credentials().await;
    let config = Arc::new(config);
    info!(provider = %config.provider, fallback = config.fallback_to_claude, "configuration loaded");

    // ── Database ────────────────────────────────────────
    let db = Arc::new(db::connect(&config.db_path()).await?);
    info!(path = %config.db_path().display(), "database connected");

    let store = PendingMessageStore::new(Arc::clone(&db));
    let sessions = SessionRepo::new(Arc::clone(&db));
    let processes = ProcessRegistry::new();

    // ── Startup recovery: messages left claimed by the previous run ──
    let report = sweep::sweep(&store, &config.queue)
        .instrument(info_span!("startup_recovery"))
        .await?;
    info!(reset = report.reset, abandoned = report.abandoned, "stale messages recovered");

    // ── Backend + manager ───────────────────────────────
    let ctx = AgentContext {
        store: store.clone(),
        sessions: sessions.clone(),
        responses: ResponseProcessor::new(
            store.clone(),
            ObservationRepo::new(Arc::clone(&db)),
            config.queue.max_retries,
        ),
        processes: processes.clone(),
        idle_timeout: config.queue.idle_timeout(),
    };
    let agent = build_agent(&config, ctx)?;
    let manager = SessionManager::new(
        sessions.clone(),
        store.clone(),
        Arc::clone(&config),
        processes.clone(),
    )
    .with_agent(agent);

    let resumed = manager.recover_pending_sessions().await?;
    info!(resumed, "queued sessions resumed");

    // ── Background tasks ────────────────────────────────
    let ct = CancellationToken::new();
    let sweep_handle = sweep::spawn_sweep_task(store.clone(), config.queue.clone(), ct.clone());
    let reaper_handle =
        spawn_process_reaper(processes, config.process.reaper_interval(), ct.clone());

    let state = Arc::new(AppState {
        manager: manager.clone(),
        sessions,
        store,
    });
    let http_ct = ct.clone();
    let port = config.http_port;
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve(state, port, http_ct).await {
            error!(%err, "http api failed");
        }
    });

    info!("memory-worker ready");

    // ── Shutdown ────────────────────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    manager.shutdown_all().await;

    let _ = tokio::join!(http_handle, sweep_handle, reaper_handle);
    info!("memory-worker shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
