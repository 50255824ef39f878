//! Per-media metadata tasks
//!
//! `download_media_metadata` fetches the full metadata for one item and
//! ingests it (formats included); `refresh_formats` re-fetches it when a
//! download could not match or fetch a format.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::ServiceContext;
use crate::db::{MediaRecord, SourceRecord};
use crate::errors::TaskError;
use crate::filtering;
use crate::scheduler::{HandlerResult, TaskRun, TaskSpec};
use crate::services::extractor::ExtractorService;

use super::{download_media_file_spec, download_media_thumbnail_spec, premiere_hours, uuid_arg};

/// Metadata fields kept when the shrink toggle is on
const KEPT_FIELDS: &[&str] = &[
    "id",
    "display_id",
    "title",
    "fulltitle",
    "description",
    "duration",
    "thumbnail",
    "thumbnails",
    "categories",
    "age_limit",
    "uploader",
    "uploader_id",
    "channel_id",
    "like_count",
    "dislike_count",
    "average_rating",
    "epoch",
    "availability",
    "extractor_key",
    "upload_date",
    "timestamp",
    "release_timestamp",
    "playlist_title",
    "language",
    "formats",
];

pub async fn download_media_metadata(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let media_id = uuid_arg(&run.args, "media_id")?;
    let Some(media) = ctx.db.media().get_by_id(media_id).await? else {
        return Err(TaskError::NotFound(format!("media {media_id}")));
    };
    if media.manual_skip {
        info!(media_id = %media_id, key = %media.remote_key, "Media manually skipped, not fetching metadata");
        return Ok(vec![]);
    }
    let Some(source) = ctx.db.sources().get_by_id(media.source_id).await? else {
        return Err(TaskError::NotFound(format!("source {}", media.source_id)));
    };

    // The indexer rewrites this media's metadata rows while it holds this
    // lock; reschedule rather than interleave.
    let Some(_guard) = ctx.locks.try_acquire_entity("index_media", media_id) else {
        return Err(TaskError::Locked(format!("index_media:{media_id}")));
    };

    let url = ExtractorService::media_url(&media.remote_key);
    let response = match ctx.extractor.fetch_media_details(&url).await {
        Ok(response) => response,
        Err(TaskError::Premiere(eta)) => {
            let hours = premiere_hours(eta - Utc::now());
            let title = format!("Premieres in {hours} hours");
            info!(media_id = %media_id, key = %media.remote_key, eta = %eta, "Media is a premiere");
            ctx.db.media().mark_premiere(media_id, eta, &title).await?;
            return Ok(vec![]);
        }
        Err(err) => return Err(err),
    };

    let response = if ctx.config.shrink_metadata {
        shrink_response(&response)
    } else {
        response
    };

    ingest_response(&ctx, &source, &media, &response).await?;

    let mut follow_ups: Vec<TaskSpec> = Vec::new();

    // Re-read the flags we just computed to decide on follow-up work
    if let Some(updated) = ctx.db.media().get_by_id(media_id).await? {
        // Only fetch a thumbnail for media the ingest did not just skip
        if updated.thumb.is_none() && !updated.skip && !updated.manual_skip {
            if let Some(thumb_url) = best_thumbnail_url(&response) {
                follow_ups.push(download_media_thumbnail_spec(media_id, &thumb_url, 90, 10));
            }
        }

        let downloadable = source.download_enabled
            && updated.can_download
            && !updated.skip
            && !updated.manual_skip
            && !updated.downloaded;
        if downloadable {
            follow_ups.push(download_media_file_spec(media_id, &media.remote_key, false));
        }
    }

    info!(media_id = %media_id, key = %media.remote_key, "Saved metadata for media");
    Ok(follow_ups)
}

pub async fn refresh_formats(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let media_id = uuid_arg(&run.args, "media_id")?;
    let Some(media) = ctx.db.media().get_by_id(media_id).await? else {
        return Err(TaskError::NotFound(format!("media {media_id}")));
    };
    let Some(source) = ctx.db.sources().get_by_id(media.source_id).await? else {
        return Err(TaskError::NotFound(format!("source {}", media.source_id)));
    };

    let Some(_guard) = ctx.locks.try_acquire_entity("index_media", media_id) else {
        return Err(TaskError::Locked(format!("index_media:{media_id}")));
    };

    let url = ExtractorService::media_url(&media.remote_key);
    let response = ctx.extractor.fetch_media_details(&url).await?;

    let no_formats = response
        .get("formats")
        .and_then(|f| f.as_array())
        .map(|f| f.is_empty())
        .unwrap_or(true);
    if no_formats {
        warn!(media_id = %media_id, key = %media.remote_key, "Refreshed metadata carries no formats");
        ctx.db.media().update_can_download(media_id, false).await?;
        ctx.db
            .media()
            .update_skip_flags(media_id, true, media.manual_skip)
            .await?;
        return Err(TaskError::NoFormat);
    }

    ingest_response(&ctx, &source, &media, &response).await?;
    info!(media_id = %media_id, key = %media.remote_key, "Refreshed formats for media");

    let mut follow_ups = Vec::new();
    if let Some(updated) = ctx.db.media().get_by_id(media_id).await? {
        let downloadable = source.download_enabled
            && updated.can_download
            && !updated.skip
            && !updated.manual_skip
            && !updated.downloaded;
        if downloadable {
            follow_ups.push(download_media_file_spec(media_id, &media.remote_key, false));
        }
    }
    Ok(follow_ups)
}

/// Ingest one full extractor response: metadata + formats in one
/// transaction, then the denormalized fields and derived flags.
async fn ingest_response(
    ctx: &ServiceContext,
    source: &SourceRecord,
    media: &MediaRecord,
    response: &Value,
) -> Result<(), TaskError> {
    let site = string_field(response, &["extractor_key", "ie_key"])
        .unwrap_or_else(|| "Youtube".to_string());

    let uploaded_at = upload_date(response);
    let published_at = response
        .get("release_timestamp")
        .or_else(|| response.get("timestamp"))
        .and_then(|v| v.as_i64())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .or(uploaded_at);
    let retrieved_at = response
        .get("epoch")
        .and_then(|v| v.as_i64())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    ctx.db
        .metadata()
        .ingest(
            media.id,
            source.id,
            &site,
            &media.remote_key,
            response,
            uploaded_at,
            published_at,
            retrieved_at,
        )
        .await?;

    let title = string_field(response, &["title", "fulltitle"]).unwrap_or_default();
    let title = if title.is_empty() {
        media.title.clone()
    } else {
        title.chars().take(200).collect()
    };
    let duration = response
        .get("duration")
        .and_then(|v| v.as_f64())
        .map(|d| d as i32)
        .or(media.duration);
    ctx.db
        .media()
        .update_indexed_fields(media.id, &title, duration, published_at.or(media.published_at))
        .await?;

    let has_formats = response
        .get("formats")
        .and_then(|f| f.as_array())
        .map(|f| !f.is_empty())
        .unwrap_or(false);
    ctx.db.media().update_can_download(media.id, has_formats).await?;

    // Recompute the cached skip flag against the fresh fields
    if let Some(updated) = ctx.db.media().get_by_id(media.id).await? {
        let (skip, changed) = filtering::filter_media_changed(source, &updated, Utc::now());
        if changed {
            ctx.db
                .media()
                .update_skip_flags(media.id, skip, updated.manual_skip)
                .await?;
        }
    }

    Ok(())
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

/// "20170911" → that day at midnight UTC
fn upload_date(response: &Value) -> Option<DateTime<Utc>> {
    let raw = response.get("upload_date").and_then(|v| v.as_str())?;
    let date = NaiveDate::parse_from_str(raw, "%Y%m%d").ok()?;
    let time = date.and_hms_opt(0, 0, 0)?;
    Some(DateTime::from_naive_utc_and_offset(time, Utc))
}

/// Highest-preference thumbnail URL from the metadata
fn best_thumbnail_url(response: &Value) -> Option<String> {
    if let Some(thumbnails) = response.get("thumbnails").and_then(|v| v.as_array()) {
        let mut best: Option<(&Value, i64)> = None;
        for thumb in thumbnails {
            let preference = thumb.get("preference").and_then(|v| v.as_i64()).unwrap_or(0);
            if best.map(|(_, p)| preference > p).unwrap_or(true) {
                best = Some((thumb, preference));
            }
        }
        if let Some(url) = best.and_then(|(t, _)| t.get("url")).and_then(|v| v.as_str()) {
            return Some(url.to_string());
        }
    }
    response
        .get("thumbnail")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Keep only the known field set; drops bulky extractor internals
fn shrink_response(response: &Value) -> Value {
    match response.as_object() {
        Some(map) => {
            let kept: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| KEPT_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let dropped = map.len() - kept.len();
            debug!(dropped, "Shrank metadata response");
            Value::Object(kept)
        }
        None => response.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upload_date_parsing() {
        let parsed = upload_date(&json!({"upload_date": "20170911"})).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2017-09-11T00:00:00+00:00");
        assert!(upload_date(&json!({"upload_date": "bogus"})).is_none());
        assert!(upload_date(&json!({})).is_none());
    }

    #[test]
    fn test_best_thumbnail_prefers_preference() {
        let response = json!({
            "thumbnail": "https://example.invalid/fallback.jpg",
            "thumbnails": [
                {"url": "https://example.invalid/low.jpg", "preference": -10},
                {"url": "https://example.invalid/high.jpg", "preference": 5},
            ],
        });
        assert_eq!(
            best_thumbnail_url(&response).unwrap(),
            "https://example.invalid/high.jpg"
        );

        let bare = json!({"thumbnail": "https://example.invalid/only.jpg"});
        assert_eq!(
            best_thumbnail_url(&bare).unwrap(),
            "https://example.invalid/only.jpg"
        );
    }

    #[test]
    fn test_shrink_response_keeps_known_fields() {
        let response = json!({
            "id": "abc",
            "title": "T",
            "formats": [],
            "automatic_captions": {"en": []},
            "requested_downloads": [{"big": "blob"}],
        });
        let shrunk = shrink_response(&response);
        assert!(shrunk.get("id").is_some());
        assert!(shrunk.get("title").is_some());
        assert!(shrunk.get("formats").is_some());
        assert!(shrunk.get("automatic_captions").is_none());
        assert!(shrunk.get("requested_downloads").is_none());
    }
}
