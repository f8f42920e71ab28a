// tankhub: drains the notefile bus, keeps the fleet snapshot, dispatches
// alerts, and serves the operator JSON API.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tankhub::bus::SidecarBus;
use tankhub::http::{build_router, AppState};
use tankhub::state::{self, ServerState};
use tokio::sync::{mpsc, RwLock};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tankhub starting");

    let cfg = match std::env::args().nth(1) {
        Some(path) => tankhub::config::load_config_from_path(Path::new(&path)),
        None => tankhub::config::load_config(),
    };
    let cfg = match cfg {
        Ok(cfg) => {
            info!(
                sidecar = %cfg.bus.sidecar_addr,
                data_dir = %cfg.data_dir,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let server_state = match ServerState::open(Path::new(&cfg.data_dir)) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("FATAL: failed to open data dir: {}", e);
            std::process::exit(1);
        }
    };
    let shared = Arc::new(RwLock::new(server_state));

    let bus = Arc::new(SidecarBus::new(
        cfg.bus.sidecar_addr.clone(),
        Duration::from_millis(cfg.bus.timeout_ms),
    ));

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(state::run_serial_task(
        shared.clone(),
        bus,
        rx,
        Duration::from_secs(cfg.bus.poll_interval_secs),
    ));

    let app = AppState {
        state: shared,
        tx,
    };
    let router = build_router(app, cfg.http.dashboard_dir.map(PathBuf::from));

    let listener = match tokio::net::TcpListener::bind(&cfg.http.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {}", cfg.http.bind, e);
            std::process::exit(1);
        }
    };
    info!(addr = %cfg.http.bind, "http listening");
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("FATAL: server error: {}", e);
        std::process::exit(1);
    }
    info!("tankhub shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
