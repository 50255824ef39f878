//! Save and rename tasks
//!
//! `save_media` recomputes one media item's derived flags and self-heals
//! its download state; `rename_media_files` relocates the file and its
//! sidecars when the rendered path changed; the `*_all_*` variants fan the
//! per-media tasks out across a source.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::context::ServiceContext;
use crate::db::{MediaRecord, SourceRecord};
use crate::errors::TaskError;
use crate::filtering;
use crate::naming::nfo::NfoDetails;
use crate::naming::{self, DisplayFormat, MediaTemplateInput};
use crate::scheduler::{HandlerResult, TaskRun, TaskSpec};

use super::{
    download_media_file_spec, refresh_formats_spec, rename_all_media_for_source_spec,
    rename_media_files_spec, save_media_spec, uuid_arg,
};

/// Absolute path the media's file should live at under the current
/// template, computed from the recorded download facts.
pub async fn rendered_media_path(
    ctx: &ServiceContext,
    source: &SourceRecord,
    media: &MediaRecord,
) -> Result<PathBuf, TaskError> {
    let display = DisplayFormat::from_downloaded(media);
    let value = ctx
        .db
        .metadata()
        .get_for_media(media.id)
        .await?
        .map(|r| r.value)
        .unwrap_or_default();
    let uploader = value
        .get("uploader")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let playlist_title = value
        .get("playlist_title")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let episode = ctx
        .db
        .media()
        .episode_number(media, source.is_playlist())
        .await?
        .map(|n| format!("{n:02}"))
        .unwrap_or_default();

    let input = MediaTemplateInput {
        source,
        media,
        uploader,
        playlist_title,
        episode_str: episode,
        display,
    };
    naming::media_filepath(&ctx.config, &input).map_err(TaskError::permanent)
}

/// NFO contents for one media item
pub async fn build_nfo_details(
    ctx: &ServiceContext,
    source: &SourceRecord,
    media: &MediaRecord,
    media_path: &Path,
) -> Result<NfoDetails, TaskError> {
    let value = ctx
        .db
        .metadata()
        .get_for_media(media.id)
        .await?
        .map(|r| r.value)
        .unwrap_or_default();

    let season = if source.is_playlist() {
        "1".to_string()
    } else {
        naming::upload_year(media).to_string()
    };
    let episode = ctx
        .db
        .media()
        .episode_number(media, source.is_playlist())
        .await?
        .map(|n| n.to_string())
        .unwrap_or_default();

    let thumb = if source.copy_thumbnails {
        Some(format!("{}.jpg", naming::file_stem(media_path)))
    } else {
        None
    };

    let genres = value
        .get("categories")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(NfoDetails {
        title: media.title.clone(),
        showtitle: source.name.trim().to_string(),
        season,
        episode,
        rating: value.get("average_rating").and_then(|v| v.as_f64()),
        votes: value.get("like_count").and_then(|v| v.as_i64()).unwrap_or(0),
        plot: value
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string(),
        thumb,
        age_limit: value.get("age_limit").and_then(|v| v.as_i64()).unwrap_or(0),
        runtime_secs: media.duration.unwrap_or(0) as i64,
        remote_key: media.remote_key.clone(),
        site: value
            .get("extractor_key")
            .and_then(|v| v.as_str())
            .unwrap_or("Youtube")
            .to_string(),
        uploader: value
            .get("uploader")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        aired: media
            .published_at
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        dateadded: media.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        genres,
    })
}

/// Recompute one media item's derived flags; heal or clear a download
/// whose file no longer checks out.
pub async fn save_media(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let media_id = uuid_arg(&run.args, "media_id")?;
    let Some(mut media) = ctx.db.media().get_by_id(media_id).await? else {
        return Err(TaskError::NotFound(format!("media {media_id}")));
    };
    let Some(source) = ctx.db.sources().get_by_id(media.source_id).await? else {
        return Err(TaskError::NotFound(format!("source {}", media.source_id)));
    };

    if media.downloaded {
        heal_download_state(&ctx, &source, &mut media).await?;
    }

    let has_formats = !ctx
        .db
        .metadata()
        .format_values_for_media(media_id)
        .await?
        .is_empty();
    if has_formats != media.can_download {
        ctx.db.media().update_can_download(media_id, has_formats).await?;
        media.can_download = has_formats;
    }

    let (skip, changed) = filtering::filter_media_changed(&source, &media, Utc::now());
    if changed {
        ctx.db
            .media()
            .update_skip_flags(media_id, skip, media.manual_skip)
            .await?;
        media.skip = skip;
    }

    let mut follow_ups: Vec<TaskSpec> = Vec::new();
    let downloadable = source.download_enabled
        && media.can_download
        && !media.skip
        && !media.manual_skip
        && !media.downloaded;
    if downloadable {
        follow_ups.push(download_media_file_spec(media_id, &media.remote_key, false));
    }
    Ok(follow_ups)
}

/// Check a downloaded media's file still exists with the recorded size;
/// re-link it at the freshly rendered path after a source rename, or clear
/// the download state so it is not silently missing.
async fn heal_download_state(
    ctx: &ServiceContext,
    source: &SourceRecord,
    media: &mut MediaRecord,
) -> Result<(), TaskError> {
    let Some(media_file) = media.media_file.clone() else {
        warn!(media_id = %media.id, "Downloaded media has no file path, clearing download state");
        ctx.db.media().clear_downloaded(media.id).await?;
        media.downloaded = false;
        return Ok(());
    };

    let current = ctx.config.download_root.join(&media_file);
    if let Ok(meta) = tokio::fs::metadata(&current).await {
        let recorded = media.downloaded_filesize.unwrap_or(-1);
        if meta.len() as i64 == recorded {
            return Ok(());
        }
        warn!(
            media_id = %media.id,
            path = %current.display(),
            on_disk = meta.len(),
            recorded,
            "Downloaded file size does not match the record, clearing download state"
        );
        ctx.db.media().clear_downloaded(media.id).await?;
        media.downloaded = false;
        return Ok(());
    }

    // The file is gone from its recorded spot. A renamed source moves the
    // whole directory; try the freshly rendered path and the rendered
    // parent with the old file name before giving up.
    let rendered = rendered_media_path(ctx, source, media).await?;
    let mut candidates = vec![rendered.clone()];
    if let (Some(parent), Some(name)) = (rendered.parent(), current.file_name()) {
        candidates.push(parent.join(name));
    }
    for candidate in candidates {
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            let relative = candidate
                .strip_prefix(&ctx.config.download_root)
                .map_err(TaskError::permanent)?
                .to_string_lossy()
                .to_string();
            info!(media_id = %media.id, path = %candidate.display(), "Re-linked moved media file");
            ctx.db.media().update_media_file(media.id, &relative).await?;
            media.media_file = Some(relative);
            return Ok(());
        }
    }

    warn!(media_id = %media.id, "Downloaded file is missing, clearing download state");
    ctx.db.media().clear_downloaded(media.id).await?;
    media.downloaded = false;
    media.manual_skip = true;
    Ok(())
}

/// Move a media file (and sidecars) to its current rendered path
pub async fn rename_media_files(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let media_id = uuid_arg(&run.args, "media_id")?;
    let Some(media) = ctx.db.media().get_by_id(media_id).await? else {
        return Err(TaskError::NotFound(format!("media {media_id}")));
    };
    let Some(source) = ctx.db.sources().get_by_id(media.source_id).await? else {
        return Err(TaskError::NotFound(format!("source {}", media.source_id)));
    };

    let Some(media_file) = media.media_file.clone() else {
        return Ok(vec![]);
    };
    if !media.downloaded {
        return Ok(vec![]);
    }

    // Metadata rewrites and file moves must not interleave
    if ctx.locks.is_held_entity("index_media", media_id) {
        return Err(TaskError::Locked(format!("index_media:{media_id}")));
    }
    let Some(_guard) = ctx.locks.try_acquire_entity("media", media_id) else {
        return Err(TaskError::Locked(format!("media:{media_id}")));
    };

    let old_path = ctx.config.download_root.join(&media_file);
    let new_path = rendered_media_path(&ctx, &source, &media).await?;
    if old_path == new_path {
        debug!(media_id = %media_id, "Rendered path unchanged, nothing to rename");
        return Ok(vec![]);
    }

    let source_dir = naming::source_directory(&ctx.config, &source);
    let adopt_key = source
        .media_template
        .contains("{key}")
        .then_some(media.remote_key.as_str());

    let outcome = naming::rename::rename_files(&old_path, &new_path, &source_dir, adopt_key)
        .await
        .map_err(TaskError::transient)?;

    if outcome.moved {
        let relative = new_path
            .strip_prefix(&ctx.config.download_root)
            .map_err(TaskError::permanent)?
            .to_string_lossy()
            .to_string();
        ctx.db.media().update_media_file(media_id, &relative).await?;
        info!(
            media_id = %media_id,
            from = %old_path.display(),
            to = %new_path.display(),
            moved_sidecars = outcome.other_files_moved,
            "Renamed media files"
        );

        // The thumbnail name embedded in the NFO changed with the stem
        if source.write_nfo && source.copy_thumbnails {
            let details = build_nfo_details(&ctx, &source, &media, &new_path).await?;
            let xml = naming::nfo::render_nfo(&details).map_err(TaskError::permanent)?;
            naming::sidecars::write_nfo(&new_path, &xml)
                .await
                .map_err(TaskError::transient)?;
        }
    }

    Ok(vec![])
}

/// Fan out rename tasks for every downloaded media of a source, when the
/// configuration allows renames for its directory.
pub async fn rename_all_media_for_source(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let source_id = uuid_arg(&run.args, "source_id")?;
    let Some(source) = ctx.db.sources().get_by_id(source_id).await? else {
        return Err(TaskError::NotFound(format!("source {source_id}")));
    };
    if !ctx.config.rename_enabled_for(&source.directory) {
        debug!(source_id = %source_id, "Renames not enabled for this source directory");
        return Ok(vec![]);
    }

    let media = ctx.db.media().list_downloaded_by_source(source_id).await?;
    Ok(media
        .iter()
        .map(|item| rename_media_files_spec(item.id))
        .collect())
}

/// Recheck every media item of a source: formats refreshed where matching
/// failed, flags recomputed everywhere else, renames scheduled last.
pub async fn save_all_media_for_source(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let source_id = uuid_arg(&run.args, "source_id")?;
    let Some(source) = ctx.db.sources().get_by_id(source_id).await? else {
        return Err(TaskError::NotFound(format!("source {source_id}")));
    };

    // Keep out of the way of the index task
    if ctx.locks.is_held_entity("source", source_id) {
        return Err(TaskError::Locked(format!("source:{source_id}")));
    }
    let Some(_guard) = ctx.locks.try_acquire_global("save_all_media_for_source") else {
        return Err(TaskError::Locked("save_all_media_for_source".to_string()));
    };

    let mut follow_ups: Vec<TaskSpec> = Vec::new();

    let needs_refresh = ctx.db.media().list_needing_format_refresh(source_id).await?;
    let mut refreshed = std::collections::HashSet::new();
    for item in &needs_refresh {
        if ctx.db.metadata().media_has_metadata(item.id).await? {
            refreshed.insert(item.id);
            follow_ups.push(refresh_formats_spec(item.id, &item.remote_key));
        }
    }

    for item in ctx.db.media().list_by_source(source_id).await? {
        if !refreshed.contains(&item.id) {
            follow_ups.push(save_media_spec(item.id));
        }
    }

    follow_ups.push(rename_all_media_for_source_spec(source_id, &source.name));

    info!(
        source_id = %source_id,
        refreshing = refreshed.len(),
        total = follow_ups.len(),
        "Checking all media for source"
    );
    Ok(follow_ups)
}
