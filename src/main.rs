//! `orchestratord`: process entrypoint. Wires the config, device/interface
//! registries, process supervisor, model controller, ledger store, and the
//! HTTP router together, then serves until SIGINT/SIGTERM.
//!
//! The startup/shutdown sequence and CLI surface are grounded on the
//! teacher's standalone `model-server` binary (clap derive args, a
//! `tokio::main` entrypoint, a `shutdown_signal` future selecting on
//! ctrl_c/SIGTERM) generalized from a one-shot model server to the
//! orchestrator's own multi-model lifecycle.

mod config;
mod controller;
mod devices;
mod errors;
mod interfaces;
mod ledger;
mod process;
mod router;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;

use config::ConfigManager;
use controller::ModelController;
use devices::DeviceRegistry;
use interfaces::InterfaceRegistry;
use ledger::LedgerStore;
use process::ProcessSupervisor;

#[derive(Parser, Debug)]
#[command(name = "orchestratord")]
#[command(about = "Local LLM inference orchestrator")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, env = "CONFIG_PATH", default_value = "config.yaml")]
    config: PathBuf,

    /// Directory for durable state (the ledger's monitoring.db).
    #[arg(long, env = "ORCHESTRATOR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Overrides `program.log_level` from the config file. `RUST_LOG`, if
    /// set, takes precedence over both.
    #[arg(long)]
    log_level: Option<String>,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".orchestratord")
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match ConfigManager::load(&args.config) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("failed to load config '{}': {e}", args.config.display());
            std::process::exit(1);
        }
    };

    let configured_log_level = config.program().log_level;
    init_tracing(args.log_level.as_deref().or(Some(configured_log_level.as_str())));

    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    let db_path = data_dir.join("monitoring.db");

    let ledger = match LedgerStore::open(&db_path).await {
        Ok(l) => Arc::new(l),
        Err(e) => {
            tracing::error!(error = %e, path = %db_path.display(), "failed to open ledger store");
            std::process::exit(1);
        }
    };

    let program = config.program();
    if program.disable_gpu_monitoring {
        tracing::info!("GPU monitoring disabled; device admission checks are skipped");
    }
    let devices = Arc::new(DeviceRegistry::default_registry());
    let interfaces = Arc::new(InterfaceRegistry::default_registry());
    let supervisor = ProcessSupervisor::new();
    let controller = ModelController::new(
        config.clone(),
        devices.clone(),
        interfaces.clone(),
        supervisor.clone(),
        ledger.clone(),
    );

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    if let Err(e) = ledger.add_program_runtime_start(now).await {
        tracing::warn!(error = %e, "failed to record program runtime start");
    }

    supervisor.spawn_liveness_sweep();
    controller.spawn_idle_reaper();
    controller.spawn_liveness_reconciler();
    controller.start_auto_start_models();

    let state = router::AppState::new(config.clone(), controller.clone(), ledger.clone());
    let app = router::build_router(state);

    let addr = format!("{}:{}", program.host, program.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %addr, "failed to bind HTTP listener");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %addr, "orchestratord listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server error");
    }

    tracing::info!("shutting down: stopping all models");
    controller.shutdown_all(std::time::Duration::from_secs(3)).await;

    let end = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    if let Err(e) = ledger.update_program_runtime_end(end).await {
        tracing::warn!(error = %e, "failed to record program runtime end");
    }

    tracing::info!("shutdown complete");
}

fn init_tracing(configured_level: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(configured_level.unwrap_or("info"))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
