//! LiveDesk realtime server binary

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

use livedesk_server::dispatch::ws_handler;
use livedesk_server::store::{MemoryConversationStore, PgTenantStore};
use livedesk_server::{AppState, Config};
use livedesk_shared::{RedisCache, SharedCache};

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let bind_address = config.bind_address.clone();

    let pool =
        livedesk_shared::db::create_pool(&config.database_url, config.database_max_connections)
            .await?;
    let cache: Arc<dyn SharedCache> = Arc::new(RedisCache::connect(&config.redis_url).await?);
    let tenants = Arc::new(PgTenantStore::new(pool));

    // Conversation persistence is a collaborator of the deployment; the
    // in-memory store serves single-instance setups
    let conversations = Arc::new(MemoryConversationStore::new());

    let state = AppState::build(config, tenants, conversations, cache);
    let _maintenance = state.spawn_maintenance();

    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(addr = %bind_address, "livedesk server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
