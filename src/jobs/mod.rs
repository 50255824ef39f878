//! Background jobs: task handlers, spec builders, and cron wiring
//!
//! Each submodule implements one task body. Spec builders here carry the
//! queue, priority, delay, and retry defaults for every task so callers
//! enqueue consistently.

pub mod download;
pub mod index_source;
pub mod mediaservers;
pub mod metadata;
pub mod rename;
pub mod retention;
pub mod thumbnails;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

use crate::context::ServiceContext;
use crate::errors::TaskError;
use crate::scheduler::{
    FailureMark, FailureRouter, RetryPolicy, TaskEngine, TaskQueue, TaskRegistry, TaskSpec,
};

/// Task names
pub mod names {
    pub const INDEX_SOURCE: &str = "index_source";
    pub const DOWNLOAD_MEDIA_METADATA: &str = "download_media_metadata";
    pub const DOWNLOAD_MEDIA_THUMBNAIL: &str = "download_media_thumbnail";
    pub const DOWNLOAD_MEDIA_FILE: &str = "download_media_file";
    pub const REFRESH_FORMATS: &str = "refresh_formats";
    pub const RENAME_MEDIA_FILES: &str = "rename_media_files";
    pub const RENAME_ALL_MEDIA_FOR_SOURCE: &str = "rename_all_media_for_source";
    pub const SAVE_MEDIA: &str = "save_media";
    pub const SAVE_ALL_MEDIA_FOR_SOURCE: &str = "save_all_media_for_source";
    pub const CLEANUP_OLD_MEDIA: &str = "cleanup_old_media";
    pub const CLEANUP_REMOVED_MEDIA: &str = "cleanup_removed_media";
    pub const DELETE_MEDIA: &str = "delete_media";
    pub const DELETE_ALL_MEDIA_FOR_SOURCE: &str = "delete_all_media_for_source";
    pub const RESCAN_MEDIA_SERVER: &str = "rescan_media_server";
    pub const CLEANUP_TASK_HISTORY: &str = "cleanup_task_history";
}

/// Pull a uuid out of task args; malformed args are a permanent failure
pub fn uuid_arg(args: &Value, key: &str) -> Result<Uuid, TaskError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| TaskError::permanent(anyhow::anyhow!("task args missing {key}")))
}

pub fn bool_arg(args: &Value, key: &str) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

// Spec builders. Queue, priority, delay, and retry defaults live here so
// every enqueue site agrees.

pub fn index_source_spec(source_id: Uuid, source_name: &str) -> TaskSpec {
    TaskSpec::new(
        names::INDEX_SOURCE,
        json!({"source_id": source_id}),
        TaskQueue::Limit,
    )
    .priority(80)
    .delay(Duration::from_secs(300))
    .expires(Duration::from_secs(40 * 60))
    .retry(RetryPolicy::none())
    .remove_duplicates()
    .verbose_name(format!("Index media from source \"{source_name}\""))
    .for_source(source_id)
    .failure_mark(FailureMark::SourceFailed(source_id))
}

pub fn download_media_metadata_spec(media_id: Uuid, key: &str, priority: i32) -> TaskSpec {
    TaskSpec::new(
        names::DOWNLOAD_MEDIA_METADATA,
        json!({"media_id": media_id}),
        TaskQueue::Limit,
    )
    .priority(priority)
    .delay(Duration::from_secs(60))
    .retry(RetryPolicy {
        max_attempts: 3,
        base_secs: 600.0,
        exponent: 1.0,
        max_interval_secs: 3600.0,
    })
    .remove_duplicates()
    .verbose_name(format!("Downloading metadata for \"{key}\""))
    .for_media(media_id)
    .failure_mark(FailureMark::MediaSkip(media_id))
}

pub fn download_media_thumbnail_spec(
    media_id: Uuid,
    url: &str,
    priority: i32,
    delay_secs: u64,
) -> TaskSpec {
    TaskSpec::new(
        names::DOWNLOAD_MEDIA_THUMBNAIL,
        json!({"media_id": media_id, "url": url}),
        TaskQueue::Net,
    )
    .priority(priority)
    .delay(Duration::from_secs(delay_secs))
    .retry(RetryPolicy::attempts(15))
    .verbose_name(format!("Downloading thumbnail for media {media_id}"))
    .for_media(media_id)
}

pub fn download_media_file_spec(media_id: Uuid, key: &str, override_existing: bool) -> TaskSpec {
    let priority = if override_existing { 40 } else { 70 };
    TaskSpec::new(
        names::DOWNLOAD_MEDIA_FILE,
        json!({"media_id": media_id, "override": override_existing}),
        TaskQueue::Limit,
    )
    .priority(priority)
    .delay(Duration::from_secs(60))
    .retry(RetryPolicy::attempts(5))
    .remove_duplicates()
    .verbose_name(format!("Downloading media for \"{key}\""))
    .for_media(media_id)
}

pub fn refresh_formats_spec(media_id: Uuid, key: &str) -> TaskSpec {
    TaskSpec::new(
        names::REFRESH_FORMATS,
        json!({"media_id": media_id}),
        TaskQueue::Limit,
    )
    .priority(50)
    .retry(RetryPolicy {
        max_attempts: 15,
        base_secs: 3600.0,
        exponent: 1.0,
        max_interval_secs: 24.0 * 3600.0,
    })
    .remove_duplicates()
    .verbose_name(format!("Refreshing formats for \"{key}\""))
    .for_media(media_id)
    .failure_mark(FailureMark::MediaSkip(media_id))
}

pub fn rename_media_files_spec(media_id: Uuid) -> TaskSpec {
    TaskSpec::new(
        names::RENAME_MEDIA_FILES,
        json!({"media_id": media_id}),
        TaskQueue::Fs,
    )
    .priority(70)
    .delay(Duration::from_secs(60))
    .retry(RetryPolicy {
        max_attempts: 5,
        base_secs: 60.0,
        exponent: 1.0,
        max_interval_secs: 600.0,
    })
    .remove_duplicates()
    .for_media(media_id)
}

pub fn rename_all_media_for_source_spec(source_id: Uuid, source_name: &str) -> TaskSpec {
    TaskSpec::new(
        names::RENAME_ALL_MEDIA_FOR_SOURCE,
        json!({"source_id": source_id}),
        TaskQueue::Fs,
    )
    .priority(80)
    .delay(Duration::from_secs(300))
    .retry(RetryPolicy::attempts(5))
    .remove_duplicates()
    .verbose_name(format!("Renaming downloaded media from source \"{source_name}\""))
    .for_source(source_id)
}

pub fn save_media_spec(media_id: Uuid) -> TaskSpec {
    TaskSpec::new(names::SAVE_MEDIA, json!({"media_id": media_id}), TaskQueue::Fs)
        .priority(80)
        .delay(Duration::from_secs(60))
        .retry(RetryPolicy {
            max_attempts: 5,
            base_secs: 60.0,
            exponent: 1.0,
            max_interval_secs: 600.0,
        })
        .remove_duplicates()
        .for_media(media_id)
}

pub fn save_all_media_for_source_spec(source_id: Uuid, source_name: &str) -> TaskSpec {
    TaskSpec::new(
        names::SAVE_ALL_MEDIA_FOR_SOURCE,
        json!({"source_id": source_id}),
        TaskQueue::Fs,
    )
    .priority(70)
    .delay(Duration::from_secs(600))
    .retry(RetryPolicy::attempts(15))
    .remove_duplicates()
    .verbose_name(format!("Checking all media for \"{source_name}\""))
    .for_source(source_id)
}

pub fn cleanup_old_media_spec() -> TaskSpec {
    TaskSpec::new(names::CLEANUP_OLD_MEDIA, json!({}), TaskQueue::Fs)
        .priority(90)
        .retry(RetryPolicy::none())
        .remove_duplicates()
}

pub fn cleanup_removed_media_spec(source_id: Uuid, observed_keys: Vec<String>) -> TaskSpec {
    TaskSpec::new(
        names::CLEANUP_REMOVED_MEDIA,
        json!({"source_id": source_id, "observed_keys": observed_keys}),
        TaskQueue::Fs,
    )
    .priority(90)
    .retry(RetryPolicy::none())
    .for_source(source_id)
}

pub fn delete_media_spec(media_id: Uuid) -> TaskSpec {
    TaskSpec::new(names::DELETE_MEDIA, json!({"media_id": media_id}), TaskQueue::Fs)
        .priority(90)
        .delay(Duration::from_secs(60))
        .retry(RetryPolicy {
            max_attempts: 5,
            base_secs: 60.0,
            exponent: 1.0,
            max_interval_secs: 600.0,
        })
        .remove_duplicates()
        .for_media(media_id)
}

pub fn delete_all_media_for_source_spec(
    source_id: Uuid,
    source_name: &str,
    source_directory: &str,
) -> TaskSpec {
    TaskSpec::new(
        names::DELETE_ALL_MEDIA_FOR_SOURCE,
        json!({
            "source_id": source_id,
            "source_name": source_name,
            "source_directory": source_directory,
        }),
        TaskQueue::Fs,
    )
    .priority(99)
    .delay(Duration::from_secs(90))
    .retry(RetryPolicy::attempts(15))
    .remove_duplicates()
    .verbose_name(format!("Deleting all media for source \"{source_name}\""))
    .for_source(source_id)
}

pub fn rescan_media_server_spec(server_id: Uuid) -> TaskSpec {
    TaskSpec::new(
        names::RESCAN_MEDIA_SERVER,
        json!({"server_id": server_id}),
        TaskQueue::Net,
    )
    .priority(100)
    .delay(Duration::from_secs(30))
    .expires(Duration::from_secs(210))
    .retry(RetryPolicy::none())
    .remove_duplicates()
    .verbose_name("Request media server rescan".to_string())
}

pub fn cleanup_task_history_spec() -> TaskSpec {
    TaskSpec::new(names::CLEANUP_TASK_HISTORY, json!({}), TaskQueue::Db)
        .priority(50)
        .retry(RetryPolicy::none())
        .remove_duplicates()
}

/// Rescan follow-ups for every configured media server
pub async fn media_server_rescan_specs(ctx: &ServiceContext) -> Result<Vec<TaskSpec>, TaskError> {
    let servers = ctx.db.media_servers().list_all().await?;
    Ok(servers
        .iter()
        .map(|server| rescan_media_server_spec(server.id))
        .collect())
}

/// Delete a source using the two-phase contract.
///
/// Phase one runs synchronously: the doomed row is renamed out of the
/// unique-constraint space, an inactive clone adopts its media, and (when
/// the files should go too) a sentinel authorizes directory removal. Phase
/// two is the queued purge task working through the clone.
pub async fn delete_source(
    engine: &TaskEngine,
    ctx: &ServiceContext,
    source_id: Uuid,
    delete_files: bool,
) -> Result<()> {
    let clone = ctx.db.sources().begin_delete(source_id, delete_files).await?;

    if delete_files {
        let directory = crate::naming::source_directory(&ctx.config, &clone);
        tokio::fs::create_dir_all(&directory).await?;
        tokio::fs::write(directory.join(retention::TO_BE_REMOVED), b"").await?;
    }

    engine.enqueue(delete_all_media_for_source_spec(
        clone.id,
        &clone.name,
        &clone.directory,
    ));
    info!(source_id = %source_id, clone_id = %clone.id, "Source deletion scheduled");
    Ok(())
}

/// Build the registry of every task handler
pub fn build_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(names::INDEX_SOURCE, index_source::run);
    registry.register(names::DOWNLOAD_MEDIA_METADATA, metadata::download_media_metadata);
    registry.register(names::REFRESH_FORMATS, metadata::refresh_formats);
    registry.register(names::DOWNLOAD_MEDIA_THUMBNAIL, thumbnails::run);
    registry.register(names::DOWNLOAD_MEDIA_FILE, download::run);
    registry.register(names::RENAME_MEDIA_FILES, rename::rename_media_files);
    registry.register(names::RENAME_ALL_MEDIA_FOR_SOURCE, rename::rename_all_media_for_source);
    registry.register(names::SAVE_MEDIA, rename::save_media);
    registry.register(names::SAVE_ALL_MEDIA_FOR_SOURCE, rename::save_all_media_for_source);
    registry.register(names::CLEANUP_OLD_MEDIA, retention::cleanup_old_media);
    registry.register(names::CLEANUP_REMOVED_MEDIA, retention::cleanup_removed_media);
    registry.register(names::DELETE_MEDIA, retention::delete_media);
    registry.register(names::DELETE_ALL_MEDIA_FOR_SOURCE, retention::delete_all_media_for_source);
    registry.register(names::RESCAN_MEDIA_SERVER, mediaservers::run);
    registry.register(names::CLEANUP_TASK_HISTORY, retention::cleanup_task_history);
    registry
}

/// Remedial tasks enqueued when a task fails a particular way
pub fn failure_router() -> FailureRouter {
    Box::new(|err, spec| {
        let Some(media_id) = spec.media_id else {
            return Vec::new();
        };
        match err {
            // A download that cannot find or fetch its format needs the
            // format list refreshed before the retry can succeed.
            TaskError::NoFormat | TaskError::DownloadIncomplete => {
                vec![refresh_formats_spec(media_id, &media_id.to_string())]
            }
            _ => Vec::new(),
        }
    })
}

/// Initialize and start the periodic job scheduler
pub async fn start_cron(engine: Arc<TaskEngine>, ctx: Arc<ServiceContext>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Source indexing pass - every hour at :59
    let indexing_engine = engine.clone();
    let indexing_ctx = ctx.clone();
    let indexing_job = Job::new_async("0 59 * * * *", move |_uuid, _l| {
        let engine = indexing_engine.clone();
        let ctx = indexing_ctx.clone();
        Box::pin(async move {
            info!("Running indexing scheduler");
            if let Err(e) = schedule_indexing(engine, ctx).await {
                error!("Indexing scheduler error: {}", e);
            }
        })
    })?;
    scheduler.add(indexing_job).await?;

    // Premiere promotion - every hour at :40
    let premiere_engine = engine.clone();
    let premiere_ctx = ctx.clone();
    let premiere_job = Job::new_async("0 40 * * * *", move |_uuid, _l| {
        let engine = premiere_engine.clone();
        let ctx = premiere_ctx.clone();
        Box::pin(async move {
            info!("Running premiere promotion");
            if let Err(e) = promote_upcoming_premieres(engine, ctx).await {
                error!("Premiere promotion error: {}", e);
            }
        })
    })?;
    scheduler.add(premiere_job).await?;

    // History pruning and retention - daily at 4:30 AM
    let cleanup_engine = engine.clone();
    let cleanup_job = Job::new_async("0 30 4 * * *", move |_uuid, _l| {
        let engine = cleanup_engine.clone();
        Box::pin(async move {
            info!("Scheduling daily cleanup");
            engine.enqueue(cleanup_task_history_spec());
            engine.enqueue(cleanup_old_media_spec());
        })
    })?;
    scheduler.add(cleanup_job).await?;

    scheduler.start().await?;

    info!("Cron scheduler started");
    Ok(scheduler)
}

/// Enqueue an `index_source` task for every source whose schedule is due.
/// Clears stale per-media advisory locks before each enqueue.
pub async fn schedule_indexing(engine: Arc<TaskEngine>, ctx: Arc<ServiceContext>) -> Result<()> {
    let now = Utc::now();
    let next_hour = now + chrono::Duration::minutes(61);

    let sources = ctx.db.sources().list_schedulable().await?;
    for source in sources {
        let previous_run = next_hour - chrono::Duration::seconds(source.index_cadence_secs);
        let skip_source = !source.is_active()
            || source.target_schedule >= next_hour
            || source
                .last_crawl_at
                .map(|crawl| crawl >= previous_run)
                .unwrap_or(false);
        if skip_source {
            continue;
        }

        let media_ids = ctx.db.media().list_ids_by_source(source.id).await?;
        ctx.locks.clear_entities("media", &media_ids);

        info!(source_id = %source.id, name = %source.name, "Scheduling an indexing task");
        engine.enqueue(index_source_spec(source.id, &source.name));
    }
    Ok(())
}

/// Hours until a premiere goes live, matching the countdown titles
pub fn premiere_hours(delta: chrono::Duration) -> i64 {
    1 + (24 * delta.num_days()) + ((delta.num_seconds() % 86_400) / 3_600)
}

/// Clear the skip flags on premieres whose published time has passed and
/// re-enqueue their downloads; refresh the countdown title otherwise.
pub async fn promote_upcoming_premieres(
    engine: Arc<TaskEngine>,
    ctx: Arc<ServiceContext>,
) -> Result<()> {
    let now = Utc::now();
    let window_start = now - chrono::Duration::minutes(61);
    let media = ctx.db.media().list_upcoming_premieres(window_start).await?;

    for item in media {
        // Premieres have no metadata yet; anything with metadata was
        // manually skipped by the operator and is not ours to change.
        if ctx.db.metadata().media_has_metadata(item.id).await? {
            continue;
        }
        let Some(published) = item.published_at else {
            continue;
        };
        if published < now {
            info!(media_id = %item.id, key = %item.remote_key, "Premiere time passed, re-enabling media");
            ctx.db.media().update_skip_flags(item.id, false, false).await?;
            engine.enqueue(download_media_metadata_spec(item.id, &item.remote_key, 65));
            engine.enqueue(download_media_file_spec(item.id, &item.remote_key, false));
        } else {
            let hours = premiere_hours(published - now);
            let title = format!("Premieres in {hours} hours");
            ctx.db.media().mark_premiere(item.id, published, &title).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_premiere_hours() {
        assert_eq!(premiere_hours(chrono::Duration::minutes(30)), 1);
        assert_eq!(premiere_hours(chrono::Duration::hours(5)), 6);
        assert_eq!(premiere_hours(chrono::Duration::days(2)), 49);
    }

    #[test]
    fn test_spec_builders_route_queues() {
        let id = Uuid::new_v4();
        assert_eq!(index_source_spec(id, "x").queue, TaskQueue::Limit);
        assert_eq!(download_media_metadata_spec(id, "k", 60).queue, TaskQueue::Limit);
        assert_eq!(download_media_file_spec(id, "k", false).queue, TaskQueue::Limit);
        assert_eq!(download_media_thumbnail_spec(id, "u", 90, 10).queue, TaskQueue::Net);
        assert_eq!(rescan_media_server_spec(id).queue, TaskQueue::Net);
        assert_eq!(rename_media_files_spec(id).queue, TaskQueue::Fs);
        assert_eq!(delete_media_spec(id).queue, TaskQueue::Fs);
        assert_eq!(cleanup_task_history_spec().queue, TaskQueue::Db);
    }

    #[test]
    fn test_failure_router_schedules_refresh() {
        let router = failure_router();
        let media_id = Uuid::new_v4();
        let spec = download_media_file_spec(media_id, "k", false);

        let remedial = router(&TaskError::NoFormat, &spec);
        assert_eq!(remedial.len(), 1);
        assert_eq!(remedial[0].name, names::REFRESH_FORMATS);

        let remedial = router(&TaskError::RateLimited, &spec);
        assert!(remedial.is_empty());

        let no_media = cleanup_task_history_spec();
        assert!(router(&TaskError::NoFormat, &no_media).is_empty());
    }
}
