//! Workspace status daemon entrypoint.
//!
//! Hook scripts report Claude session activity per workspace over a Unix
//! socket; the daemon persists the latest status of each workspace, resets
//! workspaces stuck in `working`, and serves snapshots and a change stream
//! to UIs over a second socket.
//!
//! Everything runs on one current-thread runtime, so events from all
//! connections and the watchdog are applied one at a time.

use std::env;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod clock;
mod config;
mod db;
mod ingest;
mod notify;
mod query;
mod socket;
mod store;
mod tracker;
mod watchdog;

use clock::{Clock, SystemClock};
use config::{DaemonConfig, StoreBackend};
use db::Db;
use ingest::StatusListener;
use notify::StatusNotifier;
use query::{QueryContext, QueryServer};
use store::{MemoryStore, StatusStore};
use tracker::StatusTracker;

fn main() {
    init_logging();

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            DaemonConfig::default()
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let store = match open_store(&config, Arc::clone(&clock)) {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "Failed to open status store");
            std::process::exit(1);
        }
    };

    let tracker = Arc::new(StatusTracker::new(
        store,
        StatusNotifier::new(),
        clock,
        config.watchdog.working_timeout(),
    ));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to start async runtime");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(serve(config, tracker));
    drop(runtime);
    std::process::exit(code);
}

fn init_logging() {
    let debug_enabled = env::var("WORKSPACE_STATUS_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_store(config: &DaemonConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn StatusStore>, String> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory status store; state will not survive restart");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
        StoreBackend::Sqlite => {
            let path = config.database_path()?;
            let db = Db::new(path.clone(), clock).map_err(|err| err.to_string())?;
            info!(path = %path.display(), "Status database opened");
            Ok(Arc::new(db))
        }
    }
}

/// Runs until a shutdown signal. Returns the process exit code.
async fn serve(config: DaemonConfig, tracker: Arc<StatusTracker>) -> i32 {
    let status_path = config.status_socket_path();
    let listener = match StatusListener::bind(status_path.clone()) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %status_path.display(), "Failed to bind status socket");
            return 1;
        }
    };

    let query_path = config.query_socket_path();
    let query_context = QueryContext {
        tracker: Arc::clone(&tracker),
        tick_interval_ms: config.watchdog.tick_interval_ms,
    };
    let query_task = match QueryServer::bind(query_path.clone(), query_context) {
        Ok(server) => Some(tokio::spawn(server.run())),
        Err(err) => {
            warn!(
                error = %err,
                path = %query_path.display(),
                "Failed to bind query socket; continuing without queries"
            );
            None
        }
    };

    let watchdog_task = tokio::spawn(watchdog::run_watchdog(
        Arc::clone(&tracker),
        config.watchdog.tick_interval(),
    ));
    let ingest_task = tokio::spawn(listener.run(Arc::clone(&tracker)));

    info!(pid = std::process::id(), "Workspace status daemon started");
    shutdown_signal().await;
    info!("Shutting down workspace status daemon");

    // Aborted tasks drop their listeners, which unlinks the socket files.
    let mut tasks = vec![ingest_task, watchdog_task];
    tasks.extend(query_task);
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }
    0
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!(error = %err, "Failed to install SIGTERM handler");
            None
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "Failed to listen for Ctrl-C");
            }
        }
        _ = async {
            match terminate.as_mut() {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        } => {}
    }
}
