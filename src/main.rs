//! Refill Monitor - cross-chain refill tracking for the dual-asset faucet
//!
//! Submits volatility-driven refill requests to the faucet contract, follows
//! each request across the helper chain and back, and keeps the per-asset
//! attempt state consistent with the contract's in-flight flag.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod events;
mod metrics;
mod refill;
mod state;

use chain::{ChainProvider, FaucetClient, FaucetContract, LogSource};
use config::Settings;
use metrics::MetricsServer;
use refill::{ChainSet, PhaseCatalog, Reconciler, RefillCoordinator};
use state::{MemorySnapshotStore, RefillBoard, SnapshotStore, StateManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    init_logging(settings.logging.json);

    info!("Starting Refill Monitor v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Faucet on {} ({}), helper on {} ({})",
        settings.chains.local.name,
        settings.chains.local.chain_id,
        settings.chains.remote.name,
        settings.chains.remote.chain_id
    );

    // Snapshot persistence: PostgreSQL when configured, memory otherwise
    let (store, database): (Arc<dyn SnapshotStore>, Option<Arc<StateManager>>) =
        match &settings.database {
            Some(db) => {
                let manager = Arc::new(StateManager::new(db).await?);
                info!("Database connection established");

                manager.run_migrations().await?;
                info!("Database migrations complete");

                manager.spawn_listener();
                let store: Arc<dyn SnapshotStore> = manager.clone();
                (store, Some(manager))
            }
            None => {
                warn!("No database configured; refill snapshots will not survive restarts");
                let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
                (store, None)
            }
        };

    // Chain connections
    let local = Arc::new(ChainProvider::new(settings.chains.local.clone())?);
    let remote = Arc::new(ChainProvider::new(settings.chains.remote.clone())?);
    info!("Chain connections initialized");

    let wallet = FaucetContract::load_wallet(
        &settings.wallet.private_key_env,
        settings.chains.local.chain_id,
    )?;
    let faucet: Arc<dyn FaucetClient> = Arc::new(FaucetContract::new(
        settings.chains.local.address()?,
        local.http().clone(),
        wallet,
    ));

    let local_source: Arc<dyn LogSource> = local.clone();
    let remote_source: Arc<dyn LogSource> = remote.clone();
    let chains = ChainSet {
        faucet,
        local: local_source,
        remote: remote_source,
        helper: settings.chains.remote.address()?,
    };

    // Refill core
    let board = Arc::new(RefillBoard::new(settings.explorer.base_url.clone()));
    board.hydrate(store.as_ref()).await;

    let coordinator = Arc::new(RefillCoordinator::new(
        chains,
        board.clone(),
        store.clone(),
        PhaseCatalog::with_overrides(&settings.phases),
        settings.monitor.clone(),
    ));
    coordinator.restore_all().await;
    info!("Refill state restored");

    let reconciler = Arc::new(Reconciler::new(coordinator.clone()));
    let reconcile_handle = tokio::spawn(reconciler.run());

    let sync_handle = tokio::spawn(
        board
            .clone()
            .follow(store.clone(), settings.monitor.sync_interval()),
    );

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let state = api::AppState {
            coordinator: coordinator.clone(),
            database,
        };
        async move {
            if let Err(e) = api::run_server(api_config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Refill Monitor is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    for asset in state::Asset::ALL {
        coordinator.monitors().deactivate(asset);
    }

    api_handle.abort();
    reconcile_handle.abort();
    sync_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Refill Monitor stopped");
    Ok(())
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,refill_monitor=debug,sqlx=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
