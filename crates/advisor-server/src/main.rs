mod configuration;
mod error;
mod routes;
mod state;

use advisor::providers::factory;
use advisor::queue::WriteQueue;
use advisor::store::{FileFallbackStore, InMemoryMessageStore, MessageStore};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let settings = configuration::Settings::new()?;
    let addr = settings.server.socket_addr()?;

    let provider = factory::get_provider(settings.provider.into_config())?;

    // Conversations live in memory; writes the queue gives up on survive restarts
    let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
    let fallback_path = settings.storage.fallback_path()?;
    info!("keeping failed writes in {}", fallback_path.display());
    let fallback = Arc::new(FileFallbackStore::new(fallback_path));

    let queue = WriteQueue::new(settings.queue.into_config(), Arc::clone(&store), fallback);
    let recovered = queue.recover_failed();
    if recovered > 0 {
        info!("re-queued {} messages from a previous run", recovered);
    }

    let (online_tx, online_rx) = watch::channel(true);
    let worker = queue.spawn_worker(online_rx);

    let state = state::AppState::new(provider, store, queue.clone(), online_tx, settings.chat);

    // Create router with CORS support
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain whatever is still queued before exiting
    worker.shutdown().await;
    info!("write queue stats at exit: {:?}", queue.stats());
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
    info!("shutting down");
}
