//! Graph Collab Server - process entry point.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn};

use graph_collab_server::auth::{JwtVerifier, KeySetRegistry};
use graph_collab_server::db::{MemoryStore, RelationalStore, RestStore};
use graph_collab_server::storage::{SnapshotStore, StorageConfig};
use graph_collab_server::{router, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before the filter reads RUST_LOG
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "graph_collab_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;

    let store: Arc<dyn RelationalStore> = match &config.store_url {
        Some(url) => Arc::new(
            RestStore::new(url.clone(), config.store_service_key.clone(), config.store_timeout)
                .context("failed to build store client")?,
        ),
        None => {
            warn!("STORE_URL not set - using the in-memory store, nothing will persist");
            Arc::new(MemoryStore::new())
        }
    };

    let keys = Arc::new(KeySetRegistry::new(config.store_timeout));
    let verifier = Arc::new(JwtVerifier::new(config.verifier.clone(), keys));

    info!("Initializing snapshot storage at: {}", config.storage_path);
    let snapshots = SnapshotStore::open(&StorageConfig::new(config.storage_path.clone()))
        .context("failed to open snapshot storage")?;

    let state = Arc::new(AppState::new(config.clone(), store, verifier, snapshots));
    let flush_handle = state.sync.clone().start_flush_loop();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Graph collab server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   Rooms: ws://{}/parties/:kind/doc:<uuid>[:channel]", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    flush_handle.abort();
    state.sync.shutdown();
    // Let queued projections settle before exiting
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while state.sync.queue().pending_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
