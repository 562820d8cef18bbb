use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use migrator_core::{
    load_config, validate_config, HttpInstanceDirectory, HttpJobEngine, HttpPlacementService,
    InstanceDirectory, JobEngine, MigrationOrchestrator, MigrationStore, PlacementService,
    SqliteMigrationStore,
};
use migrator_server::api::create_router;
use migrator_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("MIGRATOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        "Configuration loaded successfully (version {}, config {})",
        VERSION,
        &config_hash[..16]
    );
    info!("Database path: {:?}", config.database.path);

    // Create SQLite migration store
    let store: Arc<dyn MigrationStore> = Arc::new(
        SqliteMigrationStore::new(&config.database.path)
            .context("Failed to create migration store")?,
    );
    info!("Migration store initialized");

    // External services
    info!("Using job engine at {}", config.job_engine.url);
    let engine: Arc<dyn JobEngine> = Arc::new(
        HttpJobEngine::new(config.job_engine.clone())
            .context("Failed to create job engine client")?,
    );
    info!("Using placement service at {}", config.placement.url);
    let placement: Arc<dyn PlacementService> = Arc::new(
        HttpPlacementService::new(config.placement.clone())
            .context("Failed to create placement client")?,
    );
    info!("Using instance directory at {}", config.directory.url);
    let directory: Arc<dyn InstanceDirectory> = Arc::new(
        HttpInstanceDirectory::new(config.directory.clone())
            .context("Failed to create directory client")?,
    );

    let orchestrator =
        MigrationOrchestrator::new(config.migration.clone(), store, engine, placement, directory);

    // Pick up actions that were running when the service last stopped
    let recovered = orchestrator.recover().await;
    if recovered > 0 {
        info!("Resumed {} running migration(s)", recovered);
    }

    // Create app state
    let state = Arc::new(AppState::new(config.clone(), orchestrator));

    // Create router
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Running jobs keep going in the job engine and are resumed on next start
    info!("Server shutting down...");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
