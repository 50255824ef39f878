//! Source database repository
//!
//! A source is a remote channel or playlist being tracked. The quality
//! policy columns drive the format matcher, the cadence columns drive the
//! indexing scheduler.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Kind of remote source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Channel addressed by its public name
    Channel,
    /// Channel addressed by its opaque id
    ChannelId,
    /// Playlist
    Playlist,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Channel => "channel",
            SourceKind::ChannelId => "channel_id",
            SourceKind::Playlist => "playlist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "channel" => Some(SourceKind::Channel),
            "channel_id" => Some(SourceKind::ChannelId),
            "playlist" => Some(SourceKind::Playlist),
            _ => None,
        }
    }
}

/// Requested resolution for a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceResolution {
    Audio,
    P360,
    P480,
    P720,
    P1080,
    P1440,
    P2160,
    P4320,
}

impl SourceResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceResolution::Audio => "audio",
            SourceResolution::P360 => "360p",
            SourceResolution::P480 => "480p",
            SourceResolution::P720 => "720p",
            SourceResolution::P1080 => "1080p",
            SourceResolution::P1440 => "1440p",
            SourceResolution::P2160 => "2160p",
            SourceResolution::P4320 => "4320p",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(SourceResolution::Audio),
            "360p" => Some(SourceResolution::P360),
            "480p" => Some(SourceResolution::P480),
            "720p" => Some(SourceResolution::P720),
            "1080p" => Some(SourceResolution::P1080),
            "1440p" => Some(SourceResolution::P1440),
            "2160p" => Some(SourceResolution::P2160),
            "4320p" => Some(SourceResolution::P4320),
        _ => None,
        }
    }

    /// Pixel height for video resolutions, 0 for audio
    pub fn height(&self) -> i64 {
        match self {
            SourceResolution::Audio => 0,
            SourceResolution::P360 => 360,
            SourceResolution::P480 => 480,
            SourceResolution::P720 => 720,
            SourceResolution::P1080 => 1080,
            SourceResolution::P1440 => 1440,
            SourceResolution::P2160 => 2160,
            SourceResolution::P4320 => 4320,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, SourceResolution::Audio)
    }
}

/// Rule for accepting non-exact format matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// No substitution is permitted
    Fail,
    /// Accept the next best resolution or codec
    NextBest,
    /// Accept the next best resolution, but only at or above the HD cutoff
    NextBestHd,
    /// Accept only candidates with the requested video codec
    RequireCodec,
}

impl Fallback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fallback::Fail => "fail",
            Fallback::NextBest => "next_best",
            Fallback::NextBestHd => "next_best_hd",
            Fallback::RequireCodec => "require_codec",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fail" => Some(Fallback::Fail),
            "next_best" => Some(Fallback::NextBest),
            "next_best_hd" => Some(Fallback::NextBestHd),
            "require_codec" => Some(Fallback::RequireCodec),
            _ => None,
        }
    }
}

/// The per-source matching policy handed to the format matcher
#[derive(Debug, Clone)]
pub struct QualityPolicy {
    pub resolution: SourceResolution,
    /// Normalized upper-case video codec name, e.g. "VP9"
    pub video_codec: String,
    /// Normalized upper-case audio codec name, e.g. "OPUS"
    pub audio_codec: String,
    pub prefer_60fps: bool,
    pub prefer_hdr: bool,
    pub fallback: Fallback,
}

impl QualityPolicy {
    pub fn can_fallback(&self) -> bool {
        self.fallback != Fallback::Fail
    }

    /// Codec substitution is only allowed when falling back without the
    /// require-codec restriction.
    pub fn can_switch_codecs(&self) -> bool {
        self.can_fallback() && self.fallback != Fallback::RequireCodec
    }
}

/// Source record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceRecord {
    pub id: Uuid,
    pub source_kind: String,
    pub key: String,
    pub name: String,
    pub directory: String,
    pub media_template: String,
    pub resolution: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub prefer_60fps: bool,
    pub prefer_hdr: bool,
    pub fallback: String,
    pub index_cadence_secs: i64,
    pub target_schedule: DateTime<Utc>,
    pub download_enabled: bool,
    pub index_videos: bool,
    pub index_streams: bool,
    pub download_cap_secs: i64,
    pub delete_old: bool,
    pub days_to_keep: i32,
    pub filter_regex: String,
    pub filter_invert: bool,
    pub filter_seconds: i32,
    pub filter_seconds_min: bool,
    pub delete_removed_on_disk: bool,
    pub delete_removed_from_source: bool,
    pub copy_thumbnails: bool,
    pub write_nfo: bool,
    pub write_json: bool,
    pub embed_metadata: bool,
    pub embed_thumbnail: bool,
    pub write_subtitles: bool,
    pub auto_subtitles: bool,
    pub sub_langs: String,
    pub sponsorblock_enabled: bool,
    pub sponsorblock_categories: String,
    pub has_failed: bool,
    pub last_crawl_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SourceRecord {
    pub fn kind(&self) -> SourceKind {
        SourceKind::parse(&self.source_kind).unwrap_or(SourceKind::Channel)
    }

    pub fn resolution(&self) -> SourceResolution {
        SourceResolution::parse(&self.resolution).unwrap_or(SourceResolution::P1080)
    }

    pub fn fallback(&self) -> Fallback {
        Fallback::parse(&self.fallback).unwrap_or(Fallback::Fail)
    }

    pub fn policy(&self) -> QualityPolicy {
        QualityPolicy {
            resolution: self.resolution(),
            video_codec: self.video_codec.to_uppercase(),
            audio_codec: self.audio_codec.to_uppercase(),
            prefer_60fps: self.prefer_60fps,
            prefer_hdr: self.prefer_hdr,
            fallback: self.fallback(),
        }
    }

    pub fn is_playlist(&self) -> bool {
        self.kind() == SourceKind::Playlist
    }

    pub fn is_audio(&self) -> bool {
        self.resolution().is_audio()
    }

    /// A source is active when it still indexes or downloads anything and
    /// has a non-zero cadence.
    pub fn is_active(&self) -> bool {
        self.index_cadence_secs > 0
            && (self.download_enabled || self.index_videos || self.index_streams)
    }

    /// Cut-off before which media is too old to download, when capped
    pub fn download_cap_date(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.download_cap_secs > 0 {
            Some(now - Duration::seconds(self.download_cap_secs))
        } else {
            None
        }
    }

    /// Cut-off before which downloaded media is expired, when delete_old is on
    pub fn days_to_keep_date(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.delete_old && self.days_to_keep > 0 {
            Some(now - Duration::days(self.days_to_keep as i64))
        } else {
            None
        }
    }

    /// Container extension chosen from the policy
    pub fn extension(&self) -> &'static str {
        if self.is_audio() {
            if self.audio_codec.eq_ignore_ascii_case("MP4A") {
                "m4a"
            } else {
                "ogg"
            }
        } else {
            "mkv"
        }
    }

    /// Whether a media title passes the filter regex, honoring inversion.
    /// An empty filter accepts everything.
    pub fn title_passes_filter(&self, title: &str) -> bool {
        let pattern = self.filter_regex.trim();
        if pattern.is_empty() {
            return true;
        }
        let matched = regex::Regex::new(pattern)
            .map(|re| re.is_match(title))
            .unwrap_or(true);
        if self.filter_invert { !matched } else { matched }
    }

    /// Next indexing anchor from the cadence, aligned to the minute
    pub fn next_target_schedule(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = now + Duration::seconds(self.index_cadence_secs.max(3600));
        next - Duration::seconds(next.timestamp() % 60)
    }
}

/// Input for creating a source
#[derive(Debug, Clone)]
pub struct CreateSource {
    pub source_kind: SourceKind,
    pub key: String,
    pub name: String,
    pub directory: String,
    pub media_template: String,
    pub resolution: SourceResolution,
    pub video_codec: String,
    pub audio_codec: String,
    pub prefer_60fps: bool,
    pub prefer_hdr: bool,
    pub fallback: Fallback,
    pub index_cadence_secs: i64,
    pub download_enabled: bool,
    pub index_videos: bool,
    pub index_streams: bool,
}

const SOURCE_COLUMNS: &str = r#"
    id, source_kind, key, name, directory, media_template,
    resolution, video_codec, audio_codec, prefer_60fps, prefer_hdr, fallback,
    index_cadence_secs, target_schedule, download_enabled, index_videos, index_streams,
    download_cap_secs, delete_old, days_to_keep,
    filter_regex, filter_invert, filter_seconds, filter_seconds_min,
    delete_removed_on_disk, delete_removed_from_source,
    copy_thumbnails, write_nfo, write_json, embed_metadata, embed_thumbnail,
    write_subtitles, auto_subtitles, sub_langs,
    sponsorblock_enabled, sponsorblock_categories,
    has_failed, last_crawl_at, created_at
"#;

pub struct SourceRepository {
    pool: PgPool,
}

impl SourceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: CreateSource) -> Result<SourceRecord> {
        if input.index_cadence_secs < 0 {
            bail!("index cadence must not be negative");
        }
        let record = sqlx::query_as::<_, SourceRecord>(&format!(
            r#"
            INSERT INTO sources (
                source_kind, key, name, directory, media_template,
                resolution, video_codec, audio_codec, prefer_60fps, prefer_hdr,
                fallback, index_cadence_secs, download_enabled, index_videos, index_streams
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {SOURCE_COLUMNS}
            "#,
        ))
        .bind(input.source_kind.as_str())
        .bind(&input.key)
        .bind(&input.name)
        .bind(&input.directory)
        .bind(&input.media_template)
        .bind(input.resolution.as_str())
        .bind(input.video_codec.to_uppercase())
        .bind(input.audio_codec.to_uppercase())
        .bind(input.prefer_60fps)
        .bind(input.prefer_hdr)
        .bind(input.fallback.as_str())
        .bind(input.index_cadence_secs)
        .bind(input.download_enabled)
        .bind(input.index_videos)
        .bind(input.index_streams)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create source")?;

        Ok(record)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<SourceRecord>> {
        let record = sqlx::query_as::<_, SourceRecord>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list_all(&self) -> Result<Vec<SourceRecord>> {
        let records = sqlx::query_as::<_, SourceRecord>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Sources with a non-zero indexing cadence
    pub async fn list_schedulable(&self) -> Result<Vec<SourceRecord>> {
        let records = sqlx::query_as::<_, SourceRecord>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE index_cadence_secs > 0 ORDER BY target_schedule"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Sources that expire old downloads
    pub async fn list_with_retention(&self) -> Result<Vec<SourceRecord>> {
        let records = sqlx::query_as::<_, SourceRecord>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE delete_old = TRUE AND days_to_keep > 0"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn update_target_schedule(&self, id: Uuid, when: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sources SET target_schedule = $2 WHERE id = $1")
            .bind(id)
            .bind(when)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_has_failed(&self, id: Uuid, has_failed: bool) -> Result<()> {
        sqlx::query("UPDATE sources SET has_failed = $2 WHERE id = $1")
            .bind(id)
            .bind(has_failed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_crawl(&self, id: Uuid, when: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sources SET last_crawl_at = $2, has_failed = FALSE WHERE id = $1")
            .bind(id)
            .bind(when)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Validate a new media template against the repository's rendering
    /// rules before persisting it.
    pub async fn update_media_template(&self, id: Uuid, template: &str) -> Result<()> {
        let source = self
            .get_by_id(id)
            .await?
            .context("no such source")?;
        crate::naming::validate_template(template, &source)?;
        sqlx::query("UPDATE sources SET media_template = $2 WHERE id = $1")
            .bind(id)
            .bind(template)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Turn off all activity on a source without deleting it
    pub async fn deactivate(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sources SET
                download_enabled = FALSE,
                index_videos = FALSE,
                index_streams = FALSE,
                index_cadence_secs = 0
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// First phase of source deletion.
    ///
    /// The doomed row is renamed out of the unique-constraint space, an
    /// inactive clone carrying the original key/name/directory is inserted,
    /// and all media is reparented onto the clone. The doomed row is then
    /// deleted; the clone (and its media and files) is removed later by the
    /// asynchronous purge task. Returns the clone.
    pub async fn begin_delete(&self, id: Uuid, delete_files: bool) -> Result<SourceRecord> {
        let mut tx = self.pool.begin().await?;

        let doomed = sqlx::query_as::<_, SourceRecord>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .context("no such source")?;

        sqlx::query(
            r#"
            UPDATE sources SET
                directory = directory || '/deleted',
                key = key || '/deleted',
                name = '[Deleting] ' || name
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let clone = sqlx::query_as::<_, SourceRecord>(&format!(
            r#"
            INSERT INTO sources (
                source_kind, key, name, directory, media_template,
                resolution, video_codec, audio_codec, prefer_60fps, prefer_hdr,
                fallback, index_cadence_secs, download_enabled, index_videos,
                index_streams, delete_removed_on_disk, filter_regex, target_schedule
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, FALSE, FALSE, FALSE, $12, $13, $14)
            RETURNING {SOURCE_COLUMNS}
            "#,
        ))
        .bind(doomed.source_kind.as_str())
        .bind(&doomed.key)
        .bind(&doomed.name)
        .bind(&doomed.directory)
        .bind(&doomed.media_template)
        .bind(doomed.resolution.as_str())
        .bind(&doomed.video_codec)
        .bind(&doomed.audio_codec)
        .bind(doomed.prefer_60fps)
        .bind(doomed.prefer_hdr)
        .bind(doomed.fallback.as_str())
        .bind(delete_files)
        .bind(id.to_string())
        .bind(doomed.target_schedule)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE media SET source_id = $2 WHERE source_id = $1")
            .bind(id)
            .bind(clone.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM sources WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(clone)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM sources WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source() -> SourceRecord {
        SourceRecord {
            id: Uuid::new_v4(),
            source_kind: "channel".into(),
            key: "somechannel".into(),
            name: "Some Channel".into(),
            directory: "some-channel".into(),
            media_template: "{yyyy_mm_dd}_{source}_{title}_{key}_{format}.{ext}".into(),
            resolution: "1080p".into(),
            video_codec: "VP9".into(),
            audio_codec: "OPUS".into(),
            prefer_60fps: false,
            prefer_hdr: false,
            fallback: "fail".into(),
            index_cadence_secs: 86400,
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

    #[test]
    fn test_resolution_heights() {
        assert_eq!(SourceResolution::Audio.height(), 0);
        assert_eq!(SourceResolution::P360.height(), 360);
        assert_eq!(SourceResolution::P1080.height(), 1080);
        assert_eq!(SourceResolution::P4320.height(), 4320);
        assert_eq!(SourceResolution::parse("720p"), Some(SourceResolution::P720));
        assert_eq!(SourceResolution::parse("8k"), None);
    }

    #[test]
    fn test_policy_fallback_rules() {
        let mut source = sample_source();
        assert!(!source.policy().can_fallback());

        source.fallback = "next_best".into();
        assert!(source.policy().can_fallback());
        assert!(source.policy().can_switch_codecs());

        source.fallback = "require_codec".into();
        assert!(source.policy().can_fallback());
        assert!(!source.policy().can_switch_codecs());
    }

    #[test]
    fn test_is_active() {
        let mut source = sample_source();
        assert!(source.is_active());

        source.index_cadence_secs = 0;
        assert!(!source.is_active());

        source.index_cadence_secs = 3600;
        source.download_enabled = false;
        source.index_videos = false;
        source.index_streams = false;
        assert!(!source.is_active());
    }

    #[test]
    fn test_title_filter() {
        let mut source = sample_source();
        assert!(source.title_passes_filter("anything at all"));

        source.filter_regex = "(?i)keep me".into();
        assert!(source.title_passes_filter("Please KEEP ME around"));
        assert!(!source.title_passes_filter("drop this one"));

        source.filter_invert = true;
        assert!(!source.title_passes_filter("Please KEEP ME around"));
        assert!(source.title_passes_filter("drop this one"));
    }

    #[test]
    fn test_extension_from_policy() {
        let mut source = sample_source();
        assert_eq!(source.extension(), "mkv");

        source.resolution = "audio".into();
        source.audio_codec = "MP4A".into();
        assert_eq!(source.extension(), "m4a");

        source.audio_codec = "OPUS".into();
        assert_eq!(source.extension(), "ogg");
    }

    #[test]
    fn test_download_cap_date() {
        let source = {
            let mut s = sample_source();
            s.download_cap_secs = 3600;
            s
        };
        let now = Utc::now();
        let cap = source.download_cap_date(now).unwrap();
        assert_eq!(now - cap, Duration::seconds(3600));

        let uncapped = sample_source();
        assert!(uncapped.download_cap_date(now).is_none());
    }
}
