//! Source indexing task
//!
//! Enumerates the media currently available from a source, upserting a
//! Media row and a shallow detached Metadata row per item in batches, and
//! returns follow-up tasks for per-item metadata, thumbnails for newly
//! discovered items, removed-media reconciliation, and a full recheck.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::ServiceContext;
use crate::db::CreateMedia;
use crate::errors::TaskError;
use crate::scheduler::{HandlerResult, TaskRun, TaskSpec};

use super::{
    cleanup_old_media_spec, download_media_metadata_spec, download_media_thumbnail_spec,
    save_all_media_for_source_spec, uuid_arg,
};
use crate::services::thumbnails::thumbnail_candidates;

const MEDIA_BATCH: usize = 10;
const METADATA_BATCH: usize = 50;

pub async fn run(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let source_id = uuid_arg(&run.args, "source_id")?;
    let Some(source) = ctx.db.sources().get_by_id(source_id).await? else {
        return Err(TaskError::NotFound(format!("source {source_id}")));
    };
    // An inactive source would return an empty listing anyway
    if !source.is_active() {
        debug!(source_id = %source_id, "Source inactive, not indexing");
        return Ok(vec![]);
    }

    let Some(_guard) = ctx.locks.try_acquire_entity("source", source_id) else {
        return Err(TaskError::Locked(format!("source:{source_id}")));
    };

    let now = Utc::now();
    ctx.db
        .sources()
        .update_target_schedule(source_id, source.next_target_schedule(now))
        .await?;
    ctx.db.sources().set_has_failed(source_id, false).await?;

    let items = match ctx.extractor.list_items(&source).await {
        Ok(items) => items,
        Err(TaskError::NoMedia) => {
            warn!(source_id = %source_id, name = %source.name, "Source returned no media to index");
            ctx.db.sources().set_has_failed(source_id, true).await?;
            return Err(TaskError::NoMedia);
        }
        Err(err) => return Err(err),
    };

    let crawled_at = Utc::now();
    ctx.db.sources().record_crawl(source_id, crawled_at).await?;

    let total = items.len();
    info!(source_id = %source_id, name = %source.name, total, "Found media items for source");

    let mut follow_ups: Vec<TaskSpec> = vec![cleanup_old_media_spec()];
    let mut observed_keys: Vec<String> = Vec::with_capacity(total);
    let mut media_batch: Vec<(uuid::Uuid, CreateMedia)> = Vec::with_capacity(MEDIA_BATCH);
    let mut metadata_batch: Vec<(String, String, Value)> = Vec::with_capacity(METADATA_BATCH);

    let metadata_priority = if source.download_enabled { 65 } else { 55 };

    for (n, item) in items.iter().enumerate() {
        if run.handle.is_revoked() {
            info!(source_id = %source_id, "Indexing revoked, stopping early");
            return Ok(vec![]);
        }
        run.handle.set_progress(format!("{}/{}", n + 1, total));

        observed_keys.push(item.remote_key.clone());

        let defaults = CreateMedia {
            title: truncate(&item.title, 200),
            duration: item.duration,
            published_at: item.published_at(),
        };
        let (media, created) = ctx
            .db
            .media()
            .get_or_create(source_id, &item.remote_key, defaults.clone())
            .await?;

        if !created {
            media_batch.push((media.id, defaults));
            if media_batch.len() >= MEDIA_BATCH {
                ctx.db.media().flush_indexed_batch(&media_batch).await?;
                media_batch.clear();
            }
            debug!(source_id = %source_id, key = %item.remote_key, "Indexed media");
        } else {
            info!(source_id = %source_id, key = %item.remote_key, "Indexed new media");
            // Three candidate thumbnails; the best runs last so it ends up
            // as the stored image
            for (num, url) in thumbnail_candidates(&item.remote_key).iter().enumerate() {
                follow_ups.push(download_media_thumbnail_spec(
                    media.id,
                    url,
                    10 + (5 * num as i32),
                    65 - (30 * num as u64),
                ));
            }
        }

        let site = item.site.clone().unwrap_or_else(|| "Youtube".to_string());
        metadata_batch.push((site, item.remote_key.clone(), item.value.clone()));
        if metadata_batch.len() >= METADATA_BATCH {
            ctx.db
                .metadata()
                .flush_shallow_batch(source_id, &metadata_batch, crawled_at)
                .await?;
            metadata_batch.clear();
        }

        follow_ups.push(download_media_metadata_spec(
            media.id,
            &item.remote_key,
            metadata_priority,
        ));
    }

    ctx.db.media().flush_indexed_batch(&media_batch).await?;
    ctx.db
        .metadata()
        .flush_shallow_batch(source_id, &metadata_batch, crawled_at)
        .await?;

    follow_ups.push(super::cleanup_removed_media_spec(source_id, observed_keys));
    follow_ups.push(save_all_media_for_source_spec(source_id, &source.name));

    Ok(follow_ups)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 200), "hello");
        assert_eq!(truncate("hello", 2), "he");
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
