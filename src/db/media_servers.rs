//! Media server database repository

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Media server record from database
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MediaServerRecord {
    pub id: Uuid,
    /// "jellyfin" or "plex"
    pub server_type: String,
    pub host: String,
    pub port: i32,
    pub use_https: bool,
    pub verify_https: bool,
    pub token: String,
    /// Comma-separated list of library ids to refresh
    pub libraries: String,
    pub created_at: DateTime<Utc>,
}

impl MediaServerRecord {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host.trim(), self.port)
    }

    pub fn library_ids(&self) -> Vec<String> {
        self.libraries
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Input for creating a media server
#[derive(Debug, Clone)]
pub struct CreateMediaServer {
    pub server_type: String,
    pub host: String,
    pub port: i32,
    pub use_https: bool,
    pub verify_https: bool,
    pub token: String,
    pub libraries: String,
}

pub struct MediaServerRepository {
    pool: PgPool,
}

impl MediaServerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: CreateMediaServer) -> Result<MediaServerRecord> {
        let record = sqlx::query_as::<_, MediaServerRecord>(
            r#"
            INSERT INTO media_servers (server_type, host, port, use_https, verify_https, token, libraries)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, server_type, host, port, use_https, verify_https, token, libraries, created_at
            "#,
        )
        .bind(&input.server_type)
        .bind(&input.host)
        .bind(input.port)
        .bind(input.use_https)
        .bind(input.verify_https)
        .bind(&input.token)
        .bind(&input.libraries)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<MediaServerRecord>> {
        let record = sqlx::query_as::<_, MediaServerRecord>(
            r#"
            SELECT id, server_type, host, port, use_https, verify_https, token, libraries, created_at
            FROM media_servers WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list_all(&self) -> Result<Vec<MediaServerRecord>> {
        let records = sqlx::query_as::<_, MediaServerRecord>(
            r#"
            SELECT id, server_type, host, port, use_https, verify_https, token, libraries, created_at
            FROM media_servers ORDER BY host, port
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM media_servers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_and_libraries() {
        let server = MediaServerRecord {
            id: Uuid::new_v4(),
            server_type: "jellyfin".into(),
            host: " media.local ".into(),
            port: 8096,
            use_https: false,
            verify_https: true,
            token: "tok".into(),
            libraries: "lib1, lib2 ,,lib3".into(),
            created_at: Utc::now(),
        };

        assert_eq!(server.base_url(), "http://media.local:8096");
        assert_eq!(server.library_ids(), vec!["lib1", "lib2", "lib3"]);
    }
}
