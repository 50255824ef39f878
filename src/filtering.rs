//! Media skip filtering
//!
//! Decides whether a media item should be skipped for download. The skip
//! flag on the row is a cached conjunction of these rules; callers persist
//! the new value when it changes.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::db::{MediaRecord, SourceRecord};

/// Recompute the derived skip flag for a media item.
/// Returns the new value; the caller saves it when it differs.
pub fn filter_media(source: &SourceRecord, media: &MediaRecord, now: DateTime<Utc>) -> bool {
    let mut skip = false;

    if filter_published(media) {
        skip = true;
    }
    if filter_max_cap(source, media, now) {
        skip = true;
    }
    if filter_source_cutoff(source, media, now) {
        skip = true;
    }
    if filter_title(source, media) {
        skip = true;
    }
    if filter_duration(source, media) {
        skip = true;
    }
    if media.manual_skip {
        skip = true;
    }

    skip
}

/// Recompute and return whether the flag changed
pub fn filter_media_changed(
    source: &SourceRecord,
    media: &MediaRecord,
    now: DateTime<Utc>,
) -> (bool, bool) {
    let skip = filter_media(source, media, now);
    if skip != media.skip {
        info!(
            media_id = %media.id,
            key = %media.remote_key,
            skip,
            "Media skip flag changed"
        );
        (skip, true)
    } else {
        (skip, false)
    }
}

fn filter_published(media: &MediaRecord) -> bool {
    if media.published_at.is_none() {
        debug!(media_id = %media.id, "Media has no published date, skipping");
        return true;
    }
    false
}

fn filter_max_cap(source: &SourceRecord, media: &MediaRecord, now: DateTime<Utc>) -> bool {
    let Some(cap_date) = source.download_cap_date(now) else {
        return false;
    };
    match media.published_at {
        Some(published) if published <= cap_date => {
            debug!(media_id = %media.id, "Media is older than the download cap, skipping");
            true
        }
        _ => false,
    }
}

fn filter_source_cutoff(source: &SourceRecord, media: &MediaRecord, now: DateTime<Utc>) -> bool {
    let Some(cutoff) = source.days_to_keep_date(now) else {
        return false;
    };
    match media.published_at {
        None => true,
        Some(published) if published < cutoff => {
            debug!(
                media_id = %media.id,
                days = source.days_to_keep,
                "Media is older than the retention window, skipping"
            );
            true
        }
        _ => false,
    }
}

fn filter_title(source: &SourceRecord, media: &MediaRecord) -> bool {
    if source.filter_regex.trim().is_empty() {
        return false;
    }
    if source.title_passes_filter(&media.title) {
        return false;
    }
    debug!(media_id = %media.id, "Media title fails the source filter, skipping");
    true
}

fn filter_duration(source: &SourceRecord, media: &MediaRecord) -> bool {
    if source.filter_seconds <= 0 {
        return false;
    }
    let Some(duration) = media.duration else {
        return false;
    };
    let limit = source.filter_seconds;
    let too_short = source.filter_seconds_min && duration < limit;
    let too_long = !source.filter_seconds_min && duration > limit;
    if too_short || too_long {
        debug!(
            media_id = %media.id,
            duration,
            limit,
            "Media duration outside the source bound, skipping"
        );
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn source() -> SourceRecord {
        SourceRecord {
            id: Uuid::new_v4(),
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
            fallback: "fail".into(),
            index_cadence_secs: 3600,
            target_schedule: Utc::now(),
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
            created_at: Utc::now(),
        }
    }

    fn media(published_at: Option<DateTime<Utc>>) -> MediaRecord {
        MediaRecord {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            remote_key: "abc".into(),
            published_at,
            created_at: Utc::now(),
            title: "A Title".into(),
            duration: Some(300),
            thumb: None,
            thumb_width: None,
            thumb_height: None,
            can_download: true,
            skip: false,
            manual_skip: false,
            downloaded: false,
            download_date: None,
            downloaded_format: None,
            downloaded_height: None,
            downloaded_width: None,
            downloaded_video_codec: None,
            downloaded_audio_codec: None,
            downloaded_container: None,
            downloaded_fps: None,
            downloaded_hdr: None,
            downloaded_filesize: None,
            media_file: None,
        }
    }

    #[test]
    fn test_fresh_media_not_skipped() {
        let now = Utc::now();
        let m = media(Some(now - Duration::hours(1)));
        assert!(!filter_media(&source(), &m, now));
    }

    #[test]
    fn test_unpublished_media_skipped() {
        let now = Utc::now();
        let m = media(None);
        assert!(filter_media(&source(), &m, now));
    }

    #[test]
    fn test_download_cap_skips_old_media() {
        let now = Utc::now();
        let mut s = source();
        s.download_cap_secs = 7 * 24 * 3600;
        let fresh = media(Some(now - Duration::days(3)));
        let stale = media(Some(now - Duration::days(10)));
        assert!(!filter_media(&s, &fresh, now));
        assert!(filter_media(&s, &stale, now));
    }

    #[test]
    fn test_retention_cutoff_skips_old_media() {
        let now = Utc::now();
        let mut s = source();
        s.delete_old = true;
        s.days_to_keep = 14;
        let stale = media(Some(now - Duration::days(30)));
        assert!(filter_media(&s, &stale, now));
    }

    #[test]
    fn test_title_filter_and_invert() {
        let now = Utc::now();
        let mut s = source();
        s.filter_regex = "(?i)wanted".into();
        let mut m = media(Some(now - Duration::hours(1)));

        m.title = "Not interesting".into();
        assert!(filter_media(&s, &m, now));

        m.title = "A Wanted Episode".into();
        assert!(!filter_media(&s, &m, now));

        s.filter_invert = true;
        assert!(filter_media(&s, &m, now));
    }

    #[test]
    fn test_duration_bounds() {
        let now = Utc::now();
        let mut s = source();
        s.filter_seconds = 600;
        s.filter_seconds_min = true;
        let mut m = media(Some(now - Duration::hours(1)));

        m.duration = Some(300);
        assert!(filter_media(&s, &m, now));
        m.duration = Some(900);
        assert!(!filter_media(&s, &m, now));

        s.filter_seconds_min = false;
        assert!(filter_media(&s, &m, now));
    }

    #[test]
    fn test_manual_skip_always_skips() {
        let now = Utc::now();
        let mut m = media(Some(now - Duration::hours(1)));
        m.manual_skip = true;
        assert!(filter_media(&source(), &m, now));
    }
}
