//! Media database repository
//!
//! One row per tracked remote item. Title/duration/published are
//! denormalized from metadata for fast listing; the downloaded_* columns
//! record what actually landed on disk.

use anyhow::Result;
use chrono::{DateTime, Datelike, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Media record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MediaRecord {
    pub id: Uuid,
    pub source_id: Uuid,
    pub remote_key: String,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub duration: Option<i32>,
    pub thumb: Option<Vec<u8>>,
    pub thumb_width: Option<i32>,
    pub thumb_height: Option<i32>,
    pub can_download: bool,
    pub skip: bool,
    pub manual_skip: bool,
    pub downloaded: bool,
    pub download_date: Option<DateTime<Utc>>,
    pub downloaded_format: Option<String>,
    pub downloaded_height: Option<i32>,
    pub downloaded_width: Option<i32>,
    pub downloaded_video_codec: Option<String>,
    pub downloaded_audio_codec: Option<String>,
    pub downloaded_container: Option<String>,
    pub downloaded_fps: Option<i32>,
    pub downloaded_hdr: Option<bool>,
    pub downloaded_filesize: Option<i64>,
    /// Path of the main file, relative to the download root
    pub media_file: Option<String>,
}

impl MediaRecord {
    /// Calendar year used for season numbering and channel ordinals
    pub fn ordinal_year(&self) -> i32 {
        self.published_at.unwrap_or(self.created_at).year()
    }
}

/// Input for creating a media row during indexing
#[derive(Debug, Clone, Default)]
pub struct CreateMedia {
    pub title: String,
    pub duration: Option<i32>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Facts recorded after a completed download
#[derive(Debug, Clone)]
pub struct DownloadedInfo {
    pub format: String,
    pub height: Option<i32>,
    pub width: Option<i32>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub container: Option<String>,
    pub fps: Option<i32>,
    pub hdr: Option<bool>,
    pub filesize: i64,
    pub media_file: String,
}

const MEDIA_COLUMNS: &str = r#"
    id, source_id, remote_key, published_at, created_at, title, duration,
    thumb, thumb_width, thumb_height,
    can_download, skip, manual_skip,
    downloaded, download_date, downloaded_format, downloaded_height,
    downloaded_width, downloaded_video_codec, downloaded_audio_codec,
    downloaded_container, downloaded_fps, downloaded_hdr, downloaded_filesize,
    media_file
"#;

pub struct MediaRepository {
    pool: PgPool,
}

impl MediaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<MediaRecord>> {
        let record = sqlx::query_as::<_, MediaRecord>(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_by_key(&self, source_id: Uuid, remote_key: &str) -> Result<Option<MediaRecord>> {
        let record = sqlx::query_as::<_, MediaRecord>(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media WHERE source_id = $1 AND remote_key = $2"
        ))
        .bind(source_id)
        .bind(remote_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Fetch or insert a media row for a remote key.
    ///
    /// Returns the record and whether it was newly created. Runs in a single
    /// transaction so concurrent indexers cannot double-insert.
    pub async fn get_or_create(
        &self,
        source_id: Uuid,
        remote_key: &str,
        defaults: CreateMedia,
    ) -> Result<(MediaRecord, bool)> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query_as::<_, MediaRecord>(&format!(
            r#"
            INSERT INTO media (source_id, remote_key, title, duration, published_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_id, remote_key) DO NOTHING
            RETURNING {MEDIA_COLUMNS}
            "#,
        ))
        .bind(source_id)
        .bind(remote_key)
        .bind(&defaults.title)
        .bind(defaults.duration)
        .bind(defaults.published_at)
        .fetch_optional(&mut *tx)
        .await?;

        let (record, created) = match inserted {
            Some(record) => (record, true),
            None => {
                let record = sqlx::query_as::<_, MediaRecord>(&format!(
                    "SELECT {MEDIA_COLUMNS} FROM media WHERE source_id = $1 AND remote_key = $2"
                ))
                .bind(source_id)
                .bind(remote_key)
                .fetch_one(&mut *tx)
                .await?;
                (record, false)
            }
        };

        tx.commit().await?;
        Ok((record, created))
    }

    pub async fn list_by_source(&self, source_id: Uuid) -> Result<Vec<MediaRecord>> {
        let records = sqlx::query_as::<_, MediaRecord>(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media WHERE source_id = $1 ORDER BY published_at, created_at, remote_key"
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Ids of all media for a source; used for bulk lock clearing
    pub async fn list_ids_by_source(&self, source_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>("SELECT id FROM media WHERE source_id = $1")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    /// Downloaded media for a source, oldest first
    pub async fn list_downloaded_by_source(&self, source_id: Uuid) -> Result<Vec<MediaRecord>> {
        let records = sqlx::query_as::<_, MediaRecord>(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media WHERE source_id = $1 AND downloaded = TRUE ORDER BY download_date"
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Downloaded media for a source whose download date is before the cutoff
    pub async fn list_expired(
        &self,
        source_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MediaRecord>> {
        let records = sqlx::query_as::<_, MediaRecord>(&format!(
            r#"
            SELECT {MEDIA_COLUMNS} FROM media
            WHERE source_id = $1 AND downloaded = TRUE AND download_date < $2
            "#,
        ))
        .bind(source_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Media no longer present in the observed remote key set
    pub async fn list_removed(
        &self,
        source_id: Uuid,
        observed_keys: &[String],
    ) -> Result<Vec<MediaRecord>> {
        let records = sqlx::query_as::<_, MediaRecord>(&format!(
            r#"
            SELECT {MEDIA_COLUMNS} FROM media
            WHERE source_id = $1 AND remote_key != ALL($2)
            "#,
        ))
        .bind(source_id)
        .bind(observed_keys)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Media flagged manual_skip with a published date in the window around
    /// now; candidates for premiere promotion.
    pub async fn list_upcoming_premieres(&self, since: DateTime<Utc>) -> Result<Vec<MediaRecord>> {
        let records = sqlx::query_as::<_, MediaRecord>(&format!(
            r#"
            SELECT {MEDIA_COLUMNS} FROM media
            WHERE manual_skip = TRUE AND published_at IS NOT NULL AND published_at >= $1
            "#,
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Media with metadata that could not be matched to a format yet
    pub async fn list_needing_format_refresh(&self, source_id: Uuid) -> Result<Vec<MediaRecord>> {
        let records = sqlx::query_as::<_, MediaRecord>(&format!(
            r#"
            SELECT {MEDIA_COLUMNS} FROM media m
            WHERE m.source_id = $1
              AND m.can_download = FALSE
              AND m.skip = FALSE
              AND m.manual_skip = FALSE
              AND m.downloaded = FALSE
              AND EXISTS (SELECT 1 FROM metadata d WHERE d.media_id = m.id)
            "#,
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Position of a media item among its ordered siblings.
    ///
    /// Siblings are the source's media with metadata, ordered by
    /// (published_at, created_at, remote_key). Playlists order across the
    /// whole playlist; channels order within the item's calendar year.
    pub async fn episode_number(
        &self,
        media: &MediaRecord,
        is_playlist: bool,
    ) -> Result<Option<i64>> {
        let year_filter = if is_playlist {
            String::new()
        } else {
            format!(
                "AND EXTRACT(YEAR FROM m.published_at) = {}",
                media.ordinal_year()
            )
        };
        let ordinal = sqlx::query_scalar::<_, i64>(&format!(
            r#"
            SELECT rn FROM (
                SELECT m.id, ROW_NUMBER() OVER (
                    ORDER BY m.published_at, m.created_at, m.remote_key
                ) AS rn
                FROM media m
                WHERE m.source_id = $1
                  AND EXISTS (SELECT 1 FROM metadata d WHERE d.media_id = m.id)
                  {year_filter}
            ) ordered WHERE ordered.id = $2
            "#,
        ))
        .bind(media.source_id)
        .bind(media.id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(ordinal)
    }

    /// Update the denormalized listing fields
    pub async fn update_indexed_fields(
        &self,
        id: Uuid,
        title: &str,
        duration: Option<i32>,
        published_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE media SET
                title = $2,
                duration = COALESCE($3, duration),
                published_at = COALESCE($4, published_at)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(duration)
        .bind(published_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_skip_flags(&self, id: Uuid, skip: bool, manual_skip: bool) -> Result<()> {
        sqlx::query("UPDATE media SET skip = $2, manual_skip = $3 WHERE id = $1")
            .bind(id)
            .bind(skip)
            .bind(manual_skip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_can_download(&self, id: Uuid, can_download: bool) -> Result<()> {
        sqlx::query("UPDATE media SET can_download = $2 WHERE id = $1")
            .bind(id)
            .bind(can_download)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a premiere: skipped manually with a countdown title
    pub async fn mark_premiere(
        &self,
        id: Uuid,
        published_at: DateTime<Utc>,
        title: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE media SET manual_skip = TRUE, published_at = $2, title = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(published_at)
        .bind(title)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn store_thumbnail(
        &self,
        id: Uuid,
        image: &[u8],
        width: i32,
        height: i32,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE media SET thumb = $2, thumb_width = $3, thumb_height = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(image)
        .bind(width)
        .bind(height)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a finished download
    pub async fn mark_downloaded(&self, id: Uuid, info: &DownloadedInfo) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE media SET
                downloaded = TRUE,
                download_date = NOW(),
                downloaded_format = $2,
                downloaded_height = $3,
                downloaded_width = $4,
                downloaded_video_codec = $5,
                downloaded_audio_codec = $6,
                downloaded_container = $7,
                downloaded_fps = $8,
                downloaded_hdr = $9,
                downloaded_filesize = $10,
                media_file = $11
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&info.format)
        .bind(info.height)
        .bind(info.width)
        .bind(&info.video_codec)
        .bind(&info.audio_codec)
        .bind(&info.container)
        .bind(info.fps)
        .bind(info.hdr)
        .bind(info.filesize)
        .bind(&info.media_file)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The on-disk file vanished: clear the download state and park the
    /// media so it is not immediately re-downloaded.
    pub async fn clear_downloaded(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE media SET
                downloaded = FALSE,
                media_file = NULL,
                downloaded_filesize = NULL,
                manual_skip = TRUE
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Point the row at a relocated file and clear the skip flag
    pub async fn update_media_file(&self, id: Uuid, media_file: &str) -> Result<()> {
        sqlx::query("UPDATE media SET media_file = $2, skip = FALSE WHERE id = $1")
            .bind(id)
            .bind(media_file)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM media WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flush a batch of denormalized listing updates in one transaction
    pub async fn flush_indexed_batch(
        &self,
        batch: &[(Uuid, CreateMedia)],
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (id, fields) in batch {
            sqlx::query(
                r#"
                UPDATE media SET
                    title = $2,
                    duration = COALESCE($3, duration),
                    published_at = COALESCE($4, published_at)
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&fields.title)
            .bind(fields.duration)
            .bind(fields.published_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinal_year_prefers_published() {
        let published = DateTime::parse_from_rfc3339("2017-09-11T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let created = DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let media = MediaRecord {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            remote_key: "abc".into(),
            published_at: Some(published),
            created_at: created,
            title: String::new(),
            duration: None,
            thumb: None,
            thumb_width: None,
            thumb_height: None,
            can_download: false,
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
        };

        assert_eq!(media.ordinal_year(), 2017);

        let media = MediaRecord {
            published_at: None,
            ..media
        };
        assert_eq!(media.ordinal_year(), 2020);
    }
}
