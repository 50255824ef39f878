//! Retention tasks
//!
//! Expired downloads are deleted per-source; media that vanished from its
//! remote listing is reconciled away; deleting a media row cascades
//! through its on-disk files and sidecars; a deleted source's directory is
//! purged once the sentinel file authorizes it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::context::ServiceContext;
use crate::db::{MediaRecord, SourceRecord};
use crate::errors::TaskError;
use crate::naming;
use crate::scheduler::{HandlerResult, TaskRun, TaskSpec};

use super::{delete_media_spec, media_server_rescan_specs, uuid_arg};

/// Sidecar suffixes sharing the media file's stem
const SIDECAR_SUFFIXES: &[&str] = &["nfo", "jpg", "webp", "info.json"];

/// Extra artifacts media centers create next to the file
const POSTER_SUFFIXES: &[&str] = &["-poster.jpg", "-poster.webp", ".trickplay"];

/// Sentinel file authorizing recursive removal of a deleted source's
/// directory
pub const TO_BE_REMOVED: &str = ".to_be_removed";

/// Delete downloads that have aged out of sources with retention enabled
pub async fn cleanup_old_media(ctx: Arc<ServiceContext>, _run: TaskRun) -> HandlerResult {
    let now = Utc::now();
    let mut follow_ups: Vec<TaskSpec> = Vec::new();

    for source in ctx.db.sources().list_with_retention().await? {
        let Some(cutoff) = source.days_to_keep_date(now) else {
            continue;
        };
        let expired = ctx.db.media().list_expired(source.id, cutoff).await?;
        if !expired.is_empty() {
            info!(
                source_id = %source.id,
                name = %source.name,
                count = expired.len(),
                days = source.days_to_keep,
                "Deleting media past the retention window"
            );
        }
        follow_ups.extend(expired.iter().map(|media| delete_media_spec(media.id)));
    }

    Ok(follow_ups)
}

/// Delete media whose remote key was not in the latest listing, for
/// sources configured to follow removals.
pub async fn cleanup_removed_media(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let source_id = uuid_arg(&run.args, "source_id")?;
    let Some(source) = ctx.db.sources().get_by_id(source_id).await? else {
        return Err(TaskError::NotFound(format!("source {source_id}")));
    };
    if !source.delete_removed_from_source {
        return Ok(vec![]);
    }

    let observed_keys: Vec<String> = run
        .args
        .get("observed_keys")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if observed_keys.is_empty() {
        // An empty observation would delete everything; a failed index
        // already reported itself, so do nothing here.
        warn!(source_id = %source_id, "No observed keys, skipping removed-media reconciliation");
        return Ok(vec![]);
    }

    let removed = ctx.db.media().list_removed(source_id, &observed_keys).await?;
    if !removed.is_empty() {
        info!(
            source_id = %source_id,
            name = %source.name,
            count = removed.len(),
            "Deleting media removed from the source"
        );
    }
    Ok(removed.iter().map(|media| delete_media_spec(media.id)).collect())
}

/// Delete one media row, cascading through its files on disk
pub async fn delete_media(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let media_id = uuid_arg(&run.args, "media_id")?;
    let Some(media) = ctx.db.media().get_by_id(media_id).await? else {
        // already gone; deletion is idempotent
        return Ok(vec![]);
    };
    let Some(source) = ctx.db.sources().get_by_id(media.source_id).await? else {
        ctx.db.media().delete(media_id).await?;
        return Ok(vec![]);
    };

    if source.delete_removed_on_disk {
        remove_media_files(&ctx, &source, &media).await;
    }
    ctx.db.media().delete(media_id).await?;
    info!(media_id = %media_id, key = %media.remote_key, "Deleted media");

    Ok(media_server_rescan_specs(&ctx).await?)
}

/// Purge every media item of a (cloned, deactivated) source, then the
/// source row, then its directory when the sentinel authorizes it.
pub async fn delete_all_media_for_source(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let source_id = uuid_arg(&run.args, "source_id")?;
    let source_name = run
        .args
        .get("source_name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let source = ctx.db.sources().get_by_id(source_id).await?;
    // The source row may already be gone on a rerun; the args carry its
    // directory so the filesystem purge still completes.
    let mut directory_candidates: Vec<PathBuf> = Vec::new();
    if let Some(s) = &source {
        directory_candidates.push(naming::source_directory(&ctx.config, s));
    } else if let Some(dir) = run.args.get("source_directory").and_then(|v| v.as_str()) {
        for type_dir in [&ctx.config.video_dir_name, &ctx.config.audio_dir_name] {
            directory_candidates.push(ctx.config.download_root.join(type_dir).join(dir));
        }
    }

    if let Some(source) = &source {
        let media = ctx.db.media().list_by_source(source_id).await?;
        info!(
            source_id = %source_id,
            name = %source_name,
            count = media.len(),
            "Deleting all media for source"
        );
        for item in &media {
            ctx.db
                .media()
                .update_skip_flags(item.id, true, true)
                .await?;
            if source.delete_removed_on_disk {
                remove_media_files(&ctx, source, item).await;
            }
            ctx.db.media().delete(item.id).await?;
        }
        ctx.db.sources().delete(source_id).await?;
    }

    // Remove the directory only when the deletion marked it for removal
    for dir in directory_candidates {
        let sentinel = dir.join(TO_BE_REMOVED);
        if tokio::fs::try_exists(&sentinel).await.unwrap_or(false) {
            info!(path = %dir.display(), name = %source_name, "Deleting directory for removed source");
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(path = %dir.display(), error = %e, "Failed to remove source directory");
            }
        }
    }

    Ok(media_server_rescan_specs(&ctx).await?)
}

/// Prune old task history rows
pub async fn cleanup_task_history(ctx: Arc<ServiceContext>, _run: TaskRun) -> HandlerResult {
    let removed = ctx
        .db
        .task_history()
        .prune(ctx.config.task_history_days)
        .await?;
    info!(removed, days = ctx.config.task_history_days, "Pruned task history");
    Ok(vec![])
}

/// Remove a media item's file, its sidecars, media-center artifacts, any
/// remaining stem-prefixed files, and now-empty parent directories.
async fn remove_media_files(ctx: &ServiceContext, source: &SourceRecord, media: &MediaRecord) {
    let Some(media_file) = &media.media_file else {
        return;
    };
    let video_path = ctx.config.download_root.join(media_file);
    let stem = naming::file_stem(&video_path);

    remove_file_logged(&video_path).await;

    for suffix in SIDECAR_SUFFIXES {
        let path = video_path.with_file_name(format!("{stem}.{suffix}"));
        remove_file_logged(&path).await;
    }

    for suffix in POSTER_SUFFIXES {
        let path = video_path.with_file_name(format!("{stem}{suffix}"));
        if tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            debug!(path = %path.display(), "Removing media artifact directory");
            let _ = tokio::fs::remove_dir_all(&path).await;
        } else {
            remove_file_logged(&path).await;
        }
    }

    // Anything else sharing the stem (subtitles, partial artifacts)
    if let Some(parent) = video_path.parent() {
        if let Ok(mut entries) = tokio::fs::read_dir(parent).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(&stem) {
                    remove_file_logged(&entry.path()).await;
                }
            }
        }

        let source_dir = naming::source_directory(&ctx.config, source);
        naming::rename::prune_empty_dirs(parent, &source_dir).await;
    }
}

async fn remove_file_logged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Deleted file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete file"),
    }
}
