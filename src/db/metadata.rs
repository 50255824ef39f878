//! Metadata and format database repository
//!
//! Metadata holds the normalized extractor response for a media item; its
//! formats live in child rows numbered 1..k. Rows created while indexing
//! are parented on the source only ("detached") and adopt their media row
//! when the full metadata arrives.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Metadata record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MetadataRecord {
    pub id: Uuid,
    pub media_id: Option<Uuid>,
    pub source_id: Option<Uuid>,
    pub site: String,
    pub key: String,
    pub retrieved_at: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub value: Value,
    pub created_at: DateTime<Utc>,
}

/// Format record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FormatRecord {
    pub id: Uuid,
    pub metadata_id: Uuid,
    pub site: String,
    pub key: String,
    pub number: i32,
    pub value: Value,
}

const METADATA_COLUMNS: &str = r#"
    id, media_id, source_id, site, key, retrieved_at, uploaded_at,
    published_at, value, created_at
"#;

pub struct MetadataRepository {
    pool: PgPool,
}

impl MetadataRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_for_media(&self, media_id: Uuid) -> Result<Option<MetadataRecord>> {
        let record = sqlx::query_as::<_, MetadataRecord>(&format!(
            "SELECT {METADATA_COLUMNS} FROM metadata WHERE media_id = $1"
        ))
        .bind(media_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Whether a media item has usable metadata attached
    pub async fn media_has_metadata(&self, media_id: Uuid) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM metadata WHERE media_id = $1",
        )
        .bind(media_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Upsert a detached metadata row while indexing.
    ///
    /// The row carries the shallow listing entry and is keyed on
    /// (source_id, site, key) until the full metadata fetch adopts it.
    pub async fn upsert_shallow(
        &self,
        source_id: Uuid,
        site: &str,
        key: &str,
        value: &Value,
        retrieved_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (source_id, site, key, value, retrieved_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_id, site, key) DO UPDATE
                SET value = EXCLUDED.value,
                    retrieved_at = EXCLUDED.retrieved_at
            "#,
        )
        .bind(source_id)
        .bind(site)
        .bind(key)
        .bind(value)
        .bind(retrieved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Flush a batch of detached rows in one transaction
    pub async fn flush_shallow_batch(
        &self,
        source_id: Uuid,
        batch: &[(String, String, Value)],
        retrieved_at: DateTime<Utc>,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (site, key, value) in batch {
            sqlx::query(
                r#"
                INSERT INTO metadata (source_id, site, key, value, retrieved_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (source_id, site, key) DO UPDATE
                    SET value = EXCLUDED.value,
                        retrieved_at = EXCLUDED.retrieved_at
                "#,
            )
            .bind(source_id)
            .bind(site)
            .bind(key)
            .bind(value)
            .bind(retrieved_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Ingest a full extractor response for a media item.
    ///
    /// One transaction: the metadata row is upserted (adopting any detached
    /// row created by the indexer), the `formats` array is split out into
    /// child rows numbered 1..k in the order provided, and any trailing rows
    /// beyond k are deleted.
    #[allow(clippy::too_many_arguments)]
    pub async fn ingest(
        &self,
        media_id: Uuid,
        source_id: Uuid,
        site: &str,
        key: &str,
        raw_value: &Value,
        uploaded_at: Option<DateTime<Utc>>,
        published_at: Option<DateTime<Utc>>,
        retrieved_at: DateTime<Utc>,
    ) -> Result<MetadataRecord> {
        let mut value = raw_value.clone();
        let formats = match value.as_object_mut().and_then(|m| m.remove("formats")) {
            Some(Value::Array(formats)) => formats,
            _ => Vec::new(),
        };

        let mut tx = self.pool.begin().await?;

        // Rewrite the row already linked to this media, when there is one
        let linked = sqlx::query_as::<_, MetadataRecord>(&format!(
            r#"
            UPDATE metadata SET
                value = $4,
                uploaded_at = $5,
                published_at = $6,
                retrieved_at = $7
            WHERE media_id = $1 AND site = $2 AND key = $3
            RETURNING {METADATA_COLUMNS}
            "#,
        ))
        .bind(media_id)
        .bind(site)
        .bind(key)
        .bind(&value)
        .bind(uploaded_at)
        .bind(published_at)
        .bind(retrieved_at)
        .fetch_optional(&mut *tx)
        .await?;

        let record = if let Some(record) = linked {
            // Indexing may have left a fresh detached row behind; drop it
            // so adoption cannot collide on a later ingest.
            sqlx::query(
                "DELETE FROM metadata WHERE media_id IS NULL AND source_id = $1 AND site = $2 AND key = $3",
            )
            .bind(source_id)
            .bind(site)
            .bind(key)
            .execute(&mut *tx)
            .await?;
            record
        } else {
            // Adopt the detached row created while indexing, if any
            let adopted = sqlx::query_as::<_, MetadataRecord>(&format!(
                r#"
                UPDATE metadata SET
                    media_id = $1,
                    source_id = NULL,
                    value = $4,
                    uploaded_at = $5,
                    published_at = $6,
                    retrieved_at = $7
                WHERE media_id IS NULL AND source_id = $8 AND key = $3 AND site = $2
                RETURNING {METADATA_COLUMNS}
                "#,
            ))
            .bind(media_id)
            .bind(site)
            .bind(key)
            .bind(&value)
            .bind(uploaded_at)
            .bind(published_at)
            .bind(retrieved_at)
            .bind(source_id)
            .fetch_optional(&mut *tx)
            .await?;

            match adopted {
                Some(record) => record,
                None => {
                    sqlx::query_as::<_, MetadataRecord>(&format!(
                        r#"
                        INSERT INTO metadata (media_id, site, key, value, uploaded_at, published_at, retrieved_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        RETURNING {METADATA_COLUMNS}
                        "#,
                    ))
                    .bind(media_id)
                    .bind(site)
                    .bind(key)
                    .bind(&value)
                    .bind(uploaded_at)
                    .bind(published_at)
                    .bind(retrieved_at)
                    .fetch_one(&mut *tx)
                    .await?
                }
            }
        };

        let mut number = 0i32;
        for format in &formats {
            number += 1;
            sqlx::query(
                r#"
                INSERT INTO metadata_formats (metadata_id, site, key, number, value)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (metadata_id, site, key, number) DO UPDATE
                    SET value = EXCLUDED.value
                "#,
            )
            .bind(record.id)
            .bind(site)
            .bind(key)
            .bind(number)
            .bind(format)
            .execute(&mut *tx)
            .await?;
        }

        // Drop any numbering tail left over from a previous ingest
        sqlx::query(
            "DELETE FROM metadata_formats WHERE metadata_id = $1 AND site = $2 AND key = $3 AND number > $4",
        )
        .bind(record.id)
        .bind(site)
        .bind(key)
        .bind(number)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    pub async fn formats_for(&self, metadata_id: Uuid) -> Result<Vec<FormatRecord>> {
        let records = sqlx::query_as::<_, FormatRecord>(
            r#"
            SELECT id, metadata_id, site, key, number, value
            FROM metadata_formats
            WHERE metadata_id = $1
            ORDER BY site, key, number
            "#,
        )
        .bind(metadata_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// The raw format values for a media item, in stored order
    pub async fn format_values_for_media(&self, media_id: Uuid) -> Result<Vec<Value>> {
        let values = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT f.value
            FROM metadata_formats f
            JOIN metadata d ON d.id = f.metadata_id
            WHERE d.media_id = $1
            ORDER BY f.site, f.key, f.number
            "#,
        )
        .bind(media_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(values)
    }

    /// The stored metadata with the formats array inlined, matching the
    /// extractor's original response shape.
    pub async fn with_formats(&self, media_id: Uuid) -> Result<Option<Value>> {
        let Some(record) = self.get_for_media(media_id).await? else {
            return Ok(None);
        };
        let formats = self.format_values_for_media(media_id).await?;
        let mut value = record.value;
        if let Some(map) = value.as_object_mut() {
            map.insert("formats".to_string(), Value::Array(formats));
        }
        Ok(Some(value))
    }

    /// Remember a format id that failed to download so the matcher's
    /// choice can be audited and the refresh task can avoid it.
    pub async fn append_failed_format(&self, media_id: Uuid, format_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE metadata SET
                value = jsonb_set(
                    value,
                    '{failed_formats}',
                    COALESCE(value -> 'failed_formats', '[]'::jsonb) || to_jsonb($2::text)
                )
            WHERE media_id = $1
            "#,
        )
        .bind(media_id)
        .bind(format_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_for_media(&self, media_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM metadata WHERE media_id = $1")
            .bind(media_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
