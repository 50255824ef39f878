//! Task history database repository
//!
//! Every terminal task outcome is recorded here. The admin surface reads
//! this table; the daily cleanup job prunes it.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Terminal outcome of a task run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    FailedRetryable,
    FailedPermanent,
    Revoked,
    Expired,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::FailedRetryable => "failed-retryable",
            TaskOutcome::FailedPermanent => "failed-permanent",
            TaskOutcome::Revoked => "revoked",
            TaskOutcome::Expired => "expired",
        }
    }
}

/// Task history record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskHistoryRecord {
    pub id: Uuid,
    pub task_name: String,
    pub args: Value,
    pub queue: String,
    pub verbose_name: Option<String>,
    pub source_id: Option<Uuid>,
    pub media_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub attempts: i32,
    pub outcome: String,
    pub last_error: Option<String>,
}

/// Input for recording a finished task run
#[derive(Debug, Clone)]
pub struct RecordTaskRun {
    pub task_name: String,
    pub args: Value,
    pub queue: String,
    pub verbose_name: Option<String>,
    pub source_id: Option<Uuid>,
    pub media_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub outcome: TaskOutcome,
    pub last_error: Option<String>,
}

pub struct TaskHistoryRepository {
    pool: PgPool,
}

impl TaskHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, run: RecordTaskRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_history (
                task_name, args, queue, verbose_name, source_id, media_id,
                scheduled_at, started_at, attempts, outcome, last_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&run.task_name)
        .bind(&run.args)
        .bind(&run.queue)
        .bind(&run.verbose_name)
        .bind(run.source_id)
        .bind(run.media_id)
        .bind(run.scheduled_at)
        .bind(run.started_at)
        .bind(run.attempts)
        .bind(run.outcome.as_str())
        .bind(&run.last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_for_source(&self, source_id: Uuid, limit: i64) -> Result<Vec<TaskHistoryRecord>> {
        let records = sqlx::query_as::<_, TaskHistoryRecord>(
            r#"
            SELECT id, task_name, args, queue, verbose_name, source_id, media_id,
                   scheduled_at, started_at, finished_at, attempts, outcome, last_error
            FROM task_history
            WHERE source_id = $1
            ORDER BY finished_at DESC
            LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn list_for_media(&self, media_id: Uuid, limit: i64) -> Result<Vec<TaskHistoryRecord>> {
        let records = sqlx::query_as::<_, TaskHistoryRecord>(
            r#"
            SELECT id, task_name, args, queue, verbose_name, source_id, media_id,
                   scheduled_at, started_at, finished_at, attempts, outcome, last_error
            FROM task_history
            WHERE media_id = $1
            ORDER BY finished_at DESC
            LIMIT $2
            "#,
        )
        .bind(media_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Remove history older than the retention window. Returns rows deleted.
    pub async fn prune(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let result = sqlx::query("DELETE FROM task_history WHERE finished_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
