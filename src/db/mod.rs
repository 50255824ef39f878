//! Database connection and operations

pub mod media;
pub mod media_servers;
pub mod metadata;
pub mod sources;
pub mod task_history;

use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use media::{CreateMedia, DownloadedInfo, MediaRecord, MediaRepository};
pub use media_servers::{CreateMediaServer, MediaServerRecord, MediaServerRepository};
pub use metadata::{FormatRecord, MetadataRecord, MetadataRepository};
pub use sources::{
    CreateSource, Fallback, QualityPolicy, SourceKind, SourceRecord, SourceRepository,
    SourceResolution,
};
pub use task_history::{RecordTaskRun, TaskHistoryRecord, TaskHistoryRepository, TaskOutcome};

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    /// Connect, retrying until the database becomes available
    pub async fn connect_with_retry(url: &str, max_wait: Duration) -> Result<Self> {
        let started = std::time::Instant::now();
        loop {
            match Self::connect(url).await {
                Ok(db) => return Ok(db),
                Err(e) if started.elapsed() < max_wait => {
                    tracing::warn!(error = %e, "Database not ready, retrying in 2s");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get a source repository
    pub fn sources(&self) -> SourceRepository {
        SourceRepository::new(self.pool.clone())
    }

    /// Get a media repository
    pub fn media(&self) -> MediaRepository {
        MediaRepository::new(self.pool.clone())
    }

    /// Get a metadata repository
    pub fn metadata(&self) -> MetadataRepository {
        MetadataRepository::new(self.pool.clone())
    }

    /// Get a media server repository
    pub fn media_servers(&self) -> MediaServerRepository {
        MediaServerRepository::new(self.pool.clone())
    }

    /// Get a task history repository
    pub fn task_history(&self) -> TaskHistoryRepository {
        TaskHistoryRepository::new(self.pool.clone())
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}
