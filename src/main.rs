use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use horde_bridge::config::BridgeConfig;
use horde_bridge::runtime::RuntimeState;
use horde_bridge::status::{self, StatusBoard};
use horde_bridge::worker::{CycleDeps, WorkerPool};

/// Exit code after a second interrupt.
const FORCED_EXIT_CODE: i32 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = BridgeConfig::path_from_env();
    let config = BridgeConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    // Guard must live until exit so buffered log lines are flushed.
    let _log_guard = init_tracing(config.log_file.as_deref())?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker = %config.worker_name,
        model = %config.model,
        engine = %config.server_engine,
        server = %config.server_url,
        cluster = %config.cluster_url,
        threads = config.threads,
        moderation = %config.moderation.mode,
        "Starting horde bridge"
    );

    let config = Arc::new(config);
    let runtime = Arc::new(RuntimeState::new(config.max_failed_requests));
    let board = StatusBoard::new();
    let deps = CycleDeps::from_config(config.clone(), &runtime, board.clone())?;

    if let (Some(worker_id), Some(info)) = (&config.worker_id, &config.worker_info) {
        deps.horde.update_worker_info(worker_id, info).await;
    }

    let pool = WorkerPool::new(deps, runtime.clone());
    if !pool.preflight().await {
        bail!(
            "Generation server at {} is not healthy, refusing to start",
            config.server_url
        );
    }

    spawn_signal_handler(runtime.clone());
    let reporter = status::spawn_status_reporter(board.clone(), status::STATUS_REPORT_INTERVAL);

    pool.run().await;

    reporter.abort();
    board.log_summary().await;
    tracing::info!("Bridge stopped");
    Ok(())
}

/// Console logging, plus a plain-text file layer when a log file is configured.
fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .with_context(|| format!("logFile {} has no file name", path.display()))?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

/// First interrupt drains the workers, the second exits immediately.
fn spawn_signal_handler(runtime: Arc<RuntimeState>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::warn!("Unable to listen for interrupt signal");
            return;
        }
        tracing::warn!("Shutdown requested, finishing in-flight jobs (interrupt again to force)");
        runtime.request_shutdown();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Forced shutdown");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });
}
