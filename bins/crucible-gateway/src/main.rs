mod handlers;
mod metrics;
mod routes;

use axum::Router;
use crucible_common::config::SandboxConfig;
use crucible_common::events::EventSink;
use crucible_common::queue::JobQueue;
use crucible_common::redis::{self, RedisEventSink, RedisQueue, RedisStore};
use crucible_common::store::JobStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared handles behind every route.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn JobStore>,
    pub events: Arc<dyn EventSink>,
    pub config: Arc<SandboxConfig>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("crucible gateway booting");

    let config =
        Arc::new(SandboxConfig::load_default().expect("failed to load language configuration"));
    info!(languages = ?config.supported(), "configuration loaded");

    let conn = redis::connect(&config.redis_url)
        .await
        .expect("failed to connect to redis");
    info!(url = %config.redis_url, "connected to redis");

    let state = Arc::new(AppState {
        queue: Arc::new(RedisQueue::new(conn.clone())),
        store: Arc::new(RedisStore::new(conn.clone())),
        events: Arc::new(RedisEventSink::new(conn)),
        config: Arc::clone(&config),
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind listen address");
    info!(addr = %config.bind_addr, "http server listening");

    axum::serve(listener, app).await.expect("server error");
}
