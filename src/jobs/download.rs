//! Media download task
//!
//! Resolves the best format for a media item, invokes the extractor to
//! fetch it, records what landed on disk, writes the configured sidecars,
//! and returns media-server rescans (and possibly an upgrade retry) as
//! follow-ups.

use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{info, warn};

use crate::context::ServiceContext;
use crate::db::{DownloadedInfo, MediaRecord, SourceRecord};
use crate::errors::TaskError;
use crate::matching::{self, ParsedFormat};
use crate::naming::{self, DisplayFormat, MediaTemplateInput};
use crate::scheduler::{HandlerResult, TaskRun, TaskSpec};
use crate::services::extractor::{DownloadOptions, ExtractorService};

use super::{bool_arg, download_media_file_spec, media_server_rescan_specs, uuid_arg};

pub async fn run(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let media_id = uuid_arg(&run.args, "media_id")?;
    let override_existing = bool_arg(&run.args, "override");

    let Some(media) = ctx.db.media().get_by_id(media_id).await? else {
        return Err(TaskError::NotFound(format!("media {media_id}")));
    };
    let Some(source) = ctx.db.sources().get_by_id(media.source_id).await? else {
        return Err(TaskError::NotFound(format!("source {}", media.source_id)));
    };

    if !checklist(&ctx, &source, &media, override_existing).await? {
        return Ok(vec![]);
    }

    // The indexer rewrites metadata under this lock; wait it out
    if ctx.locks.is_held_entity("index_media", media_id) {
        return Err(TaskError::Locked(format!("index_media:{media_id}")));
    }
    let Some(_guard) = ctx.locks.try_acquire_entity("media", media_id) else {
        return Err(TaskError::Locked(format!("media:{media_id}")));
    };

    let format_values = ctx.db.metadata().format_values_for_media(media_id).await?;
    let formats = matching::parse_media_formats(&format_values);
    let Some(selector) = matching::select_format_string(&source.policy(), &formats, &ctx.matcher)
    else {
        warn!(media_id = %media_id, key = %media.remote_key, "No matching format combination");
        return Err(TaskError::NoFormat);
    };

    let output_path = render_target_path(&ctx, &source, &media, &selector, &formats).await?;
    info!(
        media_id = %media_id,
        key = %media.remote_key,
        format = %selector,
        path = %output_path.display(),
        "Downloading media"
    );

    let url = ExtractorService::media_url(&media.remote_key);
    let options = download_options(&source, &ctx.config.sponsorblock_categories);

    // Mirror download progress into the task's visible label
    let progress = {
        let mut rx = ctx.events.subscribe();
        let handle = run.handle.clone();
        let key = media.remote_key.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    crate::services::DownloadEvent::Progress {
                        remote_key,
                        percent,
                        eta,
                    } if remote_key == key => {
                        let eta = eta.unwrap_or_default();
                        handle.set_progress(format!("downloading {percent}% eta {eta}"));
                    }
                    crate::services::DownloadEvent::PostProcessStart { remote_key, stage }
                        if remote_key == key =>
                    {
                        handle.set_progress(format!("post-processing: {stage}"));
                    }
                    _ => {}
                }
            }
        })
    };

    let result = ctx
        .extractor
        .download(
            &url,
            &media.remote_key,
            &selector,
            source.extension(),
            &output_path,
            &options,
        )
        .await;
    progress.abort();

    let (format_used, container_used) = match result {
        Ok(ok) => ok,
        Err(TaskError::Premiere(eta)) => {
            let hours = super::premiere_hours(eta - chrono::Utc::now());
            let title = format!("Premieres in {hours} hours");
            info!(media_id = %media_id, key = %media.remote_key, eta = %eta, "Media is a premiere");
            ctx.db.media().mark_premiere(media_id, eta, &title).await?;
            return Ok(vec![]);
        }
        Err(TaskError::FormatUnavailable { format_id, cause }) => {
            // Remember the bad format so operators can see what happened
            ctx.db
                .metadata()
                .append_failed_format(media_id, &format_id)
                .await?;
            return Err(TaskError::FormatUnavailable { format_id, cause });
        }
        Err(err) => return Err(err),
    };

    let final_path = output_path.with_extension(&container_used);
    let file_size = tokio::fs::metadata(&final_path)
        .await
        .map(|m| m.len() as i64)
        .map_err(|_| TaskError::DownloadIncomplete)?;

    let relative = final_path
        .strip_prefix(&ctx.config.download_root)
        .map_err(|_| TaskError::permanent(anyhow!("download landed outside the download root")))?
        .to_string_lossy()
        .to_string();

    let info = downloaded_info(&format_used, &container_used, &formats, file_size, &relative);
    ctx.db.media().mark_downloaded(media_id, &info).await?;
    info!(
        media_id = %media_id,
        key = %media.remote_key,
        size = file_size,
        "Downloaded media file"
    );

    write_sidecars(&ctx, &source, &media, &final_path).await?;

    let mut follow_ups: Vec<TaskSpec> = Vec::new();
    if ctx.config.upgrade_resolution && !override_existing {
        if let Some(height) = info.height {
            if taller_format_exists(&source, &formats, height as i64) {
                follow_ups.push(download_media_file_spec(media_id, &media.remote_key, true));
            }
        }
    }
    // No-op when the file already sits at its rendered path; covers a
    // container remux changing the extension.
    follow_ups.push(super::rename_media_files_spec(media_id));
    follow_ups.extend(media_server_rescan_specs(&ctx).await?);
    Ok(follow_ups)
}

/// Preconditions for a download. A false return means the task is done
/// without doing anything; retryable problems are raised as errors.
async fn checklist(
    ctx: &ServiceContext,
    source: &SourceRecord,
    media: &MediaRecord,
    override_existing: bool,
) -> Result<bool, TaskError> {
    if override_existing {
        return Ok(true);
    }
    if !source.download_enabled {
        warn!(
            media_id = %media.id,
            source_id = %source.id,
            "Source no longer downloads media, not downloading"
        );
        return Ok(false);
    }
    if media.skip || media.manual_skip {
        warn!(media_id = %media.id, "Media is marked to be skipped, not downloading");
        return Ok(false);
    }
    // The rendered filepath needs metadata; without it there is nothing
    // to do yet, so wait for the metadata task to fill it in.
    if !ctx.db.metadata().media_has_metadata(media.id).await? {
        return Err(TaskError::transient(anyhow!("metadata is not yet available")));
    }
    if media.downloaded {
        warn!(media_id = %media.id, "Media already downloaded, not downloading again");
        return Ok(false);
    }
    if let (Some(cap_date), Some(published)) = (
        source.download_cap_date(chrono::Utc::now()),
        media.published_at,
    ) {
        if published <= cap_date {
            warn!(media_id = %media.id, "Media is too old for the download cap, not downloading");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Render the target path for the chosen format and make sure its parent
/// directory exists.
async fn render_target_path(
    ctx: &ServiceContext,
    source: &SourceRecord,
    media: &MediaRecord,
    selector: &str,
    formats: &[ParsedFormat],
) -> Result<std::path::PathBuf, TaskError> {
    let display = DisplayFormat::from_selector(selector, formats);
    let (uploader, playlist_title) = metadata_names(ctx, media).await?;
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
    let path = naming::media_filepath(&ctx.config, &input).map_err(TaskError::permanent)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TaskError::transient(anyhow!(e).context("Failed to create media directory")))?;
    }
    Ok(path)
}

async fn metadata_names(
    ctx: &ServiceContext,
    media: &MediaRecord,
) -> Result<(String, String), TaskError> {
    let record = ctx.db.metadata().get_for_media(media.id).await?;
    let value = record.map(|r| r.value).unwrap_or_default();
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
    Ok((uploader, playlist_title))
}

fn download_options(source: &SourceRecord, default_categories: &[String]) -> DownloadOptions {
    let sponsorblock_categories = if source.sponsorblock_enabled {
        let configured: Vec<String> = source
            .sponsorblock_categories
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if configured.is_empty() {
            default_categories.to_vec()
        } else {
            configured
        }
    } else {
        Vec::new()
    };
    DownloadOptions {
        embed_metadata: source.embed_metadata,
        embed_thumbnail: source.embed_thumbnail,
        write_subtitles: source.write_subtitles,
        auto_subtitles: source.auto_subtitles,
        sub_langs: source.sub_langs.clone(),
        sponsorblock_categories,
    }
}

/// Derive the downloaded_* columns from the chosen format(s)
fn downloaded_info(
    format_used: &str,
    container: &str,
    formats: &[ParsedFormat],
    file_size: i64,
    relative_path: &str,
) -> DownloadedInfo {
    let mut info = DownloadedInfo {
        format: format_used.to_string(),
        height: None,
        width: None,
        video_codec: None,
        audio_codec: None,
        container: Some(container.to_string()),
        fps: None,
        hdr: None,
        filesize: file_size,
        media_file: relative_path.to_string(),
    };

    if let Some((vid, aid)) = format_used.split_once('+') {
        if let Some(vfmt) = matching::format_by_id(formats, vid) {
            info.format = vfmt
                .format
                .clone()
                .unwrap_or_else(|| format!("{}p", vfmt.height));
            info.height = Some(vfmt.height as i32);
            info.width = Some(vfmt.width as i32);
            info.video_codec = vfmt.vcodec.clone();
            info.fps = Some(vfmt.fps as i32);
            info.hdr = Some(vfmt.is_hdr);
        }
        if let Some(afmt) = matching::format_by_id(formats, aid) {
            info.audio_codec = afmt.acodec.clone();
        }
    } else if let Some(cfmt) = matching::format_by_id(formats, format_used) {
        info.audio_codec = cfmt.acodec.clone();
        if cfmt.has_video() {
            info.format = cfmt
                .format
                .clone()
                .unwrap_or_else(|| format!("{}p", cfmt.height));
            info.height = Some(cfmt.height as i32);
            info.width = Some(cfmt.width as i32);
            info.video_codec = cfmt.vcodec.clone();
            info.fps = Some(cfmt.fps as i32);
            info.hdr = Some(cfmt.is_hdr);
        } else {
            info.format = "audio".to_string();
        }
    }

    info
}

/// Write the configured sidecar files next to the downloaded media
async fn write_sidecars(
    ctx: &ServiceContext,
    source: &SourceRecord,
    media: &MediaRecord,
    final_path: &Path,
) -> Result<(), TaskError> {
    if source.copy_thumbnails {
        if let Some(thumb) = &media.thumb {
            naming::sidecars::copy_thumbnail(final_path, thumb)
                .await
                .map_err(TaskError::transient)?;
        }
    }

    if source.write_nfo {
        let details = super::rename::build_nfo_details(ctx, source, media, final_path).await?;
        let xml = naming::nfo::render_nfo(&details).map_err(TaskError::permanent)?;
        naming::sidecars::write_nfo(final_path, &xml)
            .await
            .map_err(TaskError::transient)?;
    }

    if source.write_json {
        if let Some(metadata) = ctx.db.metadata().with_formats(media.id).await? {
            naming::sidecars::write_json(final_path, &metadata)
                .await
                .map_err(TaskError::transient)?;
        }
    }

    Ok(())
}

/// Whether a strictly taller video format with the policy codec exists
fn taller_format_exists(source: &SourceRecord, formats: &[ParsedFormat], height: i64) -> bool {
    let policy = source.policy();
    formats.iter().any(|fmt| {
        fmt.has_video()
            && !fmt.has_audio()
            && fmt.height > height
            && fmt.height <= policy.resolution.height()
            && !fmt.id.contains("-sr")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn formats() -> Vec<ParsedFormat> {
        matching::parse_media_formats(&[
            json!({"format_id": "248", "format_note": "1080p", "height": 1080, "width": 1920,
                   "vcodec": "vp9", "acodec": "none", "fps": 24}),
            json!({"format_id": "247", "format_note": "720p", "height": 720, "width": 1280,
                   "vcodec": "vp9", "acodec": "none", "fps": 24}),
            json!({"format_id": "251", "vcodec": "none", "acodec": "opus"}),
            json!({"format_id": "18", "format_note": "360p", "height": 360, "width": 640,
                   "vcodec": "avc1.42001E", "acodec": "mp4a.40.2"}),
        ])
    }

    #[test]
    fn test_downloaded_info_separate_streams() {
        let info = downloaded_info("248+251", "mkv", &formats(), 1000, "video/x/y.mkv");
        assert_eq!(info.format, "1080P");
        assert_eq!(info.height, Some(1080));
        assert_eq!(info.video_codec.as_deref(), Some("VP9"));
        assert_eq!(info.audio_codec.as_deref(), Some("OPUS"));
        assert_eq!(info.container.as_deref(), Some("mkv"));
        assert_eq!(info.filesize, 1000);
    }

    #[test]
    fn test_downloaded_info_combined() {
        let info = downloaded_info("18", "mp4", &formats(), 500, "video/x/y.mp4");
        assert_eq!(info.format, "360P");
        assert_eq!(info.video_codec.as_deref(), Some("AVC1"));
        assert_eq!(info.audio_codec.as_deref(), Some("MP4A"));
    }

    #[test]
    fn test_downloaded_info_audio_only() {
        let info = downloaded_info("251", "ogg", &formats(), 300, "audio/x/y.ogg");
        assert_eq!(info.format, "audio");
        assert_eq!(info.video_codec, None);
        assert_eq!(info.audio_codec.as_deref(), Some("OPUS"));
    }

    #[test]
    fn test_taller_format_exists() {
        let source = sample_source();
        assert!(taller_format_exists(&source, &formats(), 720));
        assert!(!taller_format_exists(&source, &formats(), 1080));
    }

    fn sample_source() -> SourceRecord {
        SourceRecord {
            id: uuid::Uuid::new_v4(),
            source_kind: "channel".into(),
            key: "chan".into(),
            name: "Chan".into(),
            directory: "chan".into(),
            media_template: "{key}.{ext}".into(),
            resolution: "1080p".into(),
            video_codec: "VP9".into(),
            audio_codec: "OPUS".into(),
            prefer_60fps: false,
            prefer_hdr: false,
            fallback: "next_best".into(),
            index_cadence_secs: 3600,
            target_schedule: chrono::Utc::now(),
            download_enabled: true,
            index_videos: true,
            index_streams: false,
            download_cap_secs: 0,
            delete_old: false,
            days_to_keep: 14,
            filter_regex: String::new(),
            filter_invert: false,
            filter_seconds: 0,
            filter_seconds_min: true,
            delete_removed_on_disk: true,
            delete_removed_from_source: false,
            copy_thumbnails: false,
            write_nfo: false,
            write_json: false,
            embed_metadata: false,
            embed_thumbnail: false,
            write_subtitles: false,
            auto_subtitles: false,
            sub_langs: "en".into(),
            sponsorblock_enabled: false,
            sponsorblock_categories: "sponsor".into(),
            has_failed: false,
            last_crawl_at: None,
            created_at: chrono::Utc::now(),
        }
    }
}
