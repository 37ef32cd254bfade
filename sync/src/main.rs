//! Tally Sync - offline write-queue runtime and local API for field clients.

use std::sync::Arc;
use tally_sync::api::{self, AppState};
use tally_sync::{Config, FileBackend, MemoryRemote, PgRemote, RemoteStore, Tally};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_sync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Tally Sync on {}:{}", config.host, config.port);

    let remote: Arc<dyn RemoteStore> = match &config.database_url {
        Some(url) => {
            let remote = PgRemote::connect(url, config.app_id.clone()).await?;
            tracing::info!("Running database migrations...");
            remote.migrate().await?;
            Arc::new(remote)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-process remote store");
            Arc::new(MemoryRemote::new())
        }
    };

    let backend = FileBackend::new(&config.data_dir)?;
    let tally = Tally::start(config.clone(), backend, remote)?;
    let app = api::router(AppState::new(Arc::clone(&tally)));

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
        })
        .await?;

    tally.shutdown();
    Ok(())
}
