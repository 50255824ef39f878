//! chansync - channel and playlist sync service
//!
//! Long-running background service that keeps a local media library in
//! sync with remote channels and playlists: indexing what is available,
//! matching and downloading the best formats, maintaining sidecars, and
//! enforcing retention.

mod config;
mod context;
mod db;
mod errors;
mod filtering;
mod jobs;
mod matching;
mod naming;
mod scheduler;
mod services;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::context::ServiceContext;
use crate::db::Database;
use crate::scheduler::{EngineConfig, TaskEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chansync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting chansync");

    // Uses retry logic to wait for the database to become available
    let db = Database::connect_with_retry(
        &config.database_url,
        std::time::Duration::from_secs(30),
    )
    .await?;
    tracing::info!("Database connected");

    db.migrate().await?;
    tracing::info!("Migrations complete");

    for dir in [
        &config.download_root,
        &config.temp_dir,
        &config.extractor_cache_dir,
    ] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let ctx = ServiceContext::new(config.clone(), db.clone())?;
    tracing::info!("Services initialized");

    let engine_config = EngineConfig {
        db_workers: config.db_workers,
        fs_workers: config.fs_workers,
        net_workers: config.net_workers,
        limit_workers: config.limit_workers.min(config.max_download_slots.max(1)),
        db_shutdown_sentinel: config.db_shutdown_sentinel.clone(),
        fs_shutdown_sentinel: config.fs_shutdown_sentinel.clone(),
    };
    let engine = TaskEngine::new(
        db.clone(),
        engine_config,
        jobs::build_registry(),
        Some(jobs::failure_router()),
    );
    engine.start(ctx.clone());
    tracing::info!("Task engine started");

    let _cron = jobs::start_cron(engine.clone(), ctx.clone()).await?;
    tracing::info!("Cron scheduler started");

    // Catch up on sources that came due while the service was down
    {
        let engine = engine.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tracing::info!("Running startup indexing pass");
            if let Err(e) = jobs::schedule_indexing(engine, ctx).await {
                tracing::warn!("Startup indexing pass failed (will retry on schedule): {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping queues");
    engine.request_stop();

    Ok(())
}
