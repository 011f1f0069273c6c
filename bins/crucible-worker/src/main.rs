mod aggregate;
mod backoff;
mod docker;
mod notify;
mod pool;
mod reaper;
mod sandbox;


use std::sync::Arc;

use crucible_common::config::SandboxConfig;
use crucible_common::queue::JobQueue;
use crucible_common::redis::{self, RedisEventSink, RedisQueue, RedisStore};
use crucible_common::store::JobStore;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::aggregate::NoScore;
use crate::docker::DockerSandbox;
use crate::notify::Notifier;
use crate::pool::ExecutionPool;
use crate::reaper::Reaper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("crucible worker booting");

    let config = Arc::new(SandboxConfig::load_default().map_err(|e| {
        error!("failed to load configuration: {e}");
        e
    })?);
    info!(
        languages = ?config.supported(),
        slots = config.max_concurrent_workers,
        "configuration loaded"
    );

    let conn = redis::connect(&config.redis_url).await.map_err(|e| {
        error!(url = %config.redis_url, "could not connect to redis: {e}");
        e
    })?;
    info!(url = %config.redis_url, "connected to redis");

    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(conn.clone()));
    let store: Arc<dyn JobStore> = Arc::new(RedisStore::new(conn.clone()));
    let sink = Arc::new(RedisEventSink::new(conn));

    let sandbox = Arc::new(DockerSandbox::connect().map_err(|e| {
        error!("could not connect to docker: {e}");
        e
    })?);
    let daemon = sandbox.handle();

    let (events, notifier) = Notifier::channel(sink);
    let notifier_handle = tokio::spawn(notifier.run());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper = Reaper::new(
        daemon,
        Arc::clone(&queue),
        Arc::clone(&store),
        events.clone(),
        config.stale_job_after_ms,
    );
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx.clone()));

    let pool = Arc::new(ExecutionPool::new(
        queue,
        store,
        sandbox,
        Arc::new(NoScore),
        events,
        Arc::clone(&config),
        shutdown_rx,
    ));
    let pool_handle = tokio::spawn(pool.run());

    signal::ctrl_c().await?;
    warn!("shutdown signal received, draining in-flight jobs");
    if shutdown_tx.send(true).is_err() {
        warn!("all tasks had already stopped");
    }

    pool_handle.await?;
    reaper_handle.await?;
    // Both event senders are gone once the pool and reaper return, so the
    // notifier drains whatever is buffered and exits.
    notifier_handle.await?;

    info!("worker shutdown complete");
    Ok(())
}
