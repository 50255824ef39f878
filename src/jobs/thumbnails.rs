//! Thumbnail download task
//!
//! Fetches one candidate thumbnail URL for a media item, stores the scaled
//! JPEG on the row, and copies it next to the video when the source keeps
//! thumbnail sidecars and the media is already on disk.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::ServiceContext;
use crate::errors::TaskError;
use crate::naming;
use crate::scheduler::{HandlerResult, TaskRun};
use crate::services::thumbnails::NoThumbnail;

use super::uuid_arg;

pub async fn run(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let media_id = uuid_arg(&run.args, "media_id")?;
    let url = run
        .args
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TaskError::permanent(anyhow::anyhow!("task args missing url")))?
        .to_string();

    let Some(media) = ctx.db.media().get_by_id(media_id).await? else {
        return Err(TaskError::NotFound(format!("media {media_id}")));
    };
    if media.skip || media.manual_skip {
        warn!(
            media_id = %media_id,
            key = %media.remote_key,
            "Media is marked to be skipped, not downloading thumbnail"
        );
        return Ok(vec![]);
    }

    let fetched = match ctx.thumbnails.fetch(&url).await {
        Ok(fetched) => fetched,
        Err(err) if err.downcast_ref::<NoThumbnail>().is_some() => {
            // A 404 means this URL pattern has no image and never will;
            // the other candidate tasks cover the media.
            debug!(media_id = %media_id, url = %url, "No thumbnail at candidate URL");
            return Err(TaskError::permanent(err));
        }
        Err(err) => return Err(TaskError::transient(err)),
    };

    ctx.db
        .media()
        .store_thumbnail(
            media_id,
            &fetched.jpeg,
            fetched.width as i32,
            fetched.height as i32,
        )
        .await?;
    info!(media_id = %media_id, key = %media.remote_key, url = %url, "Saved thumbnail for media");

    // An already-downloaded media gets its sidecar refreshed right away
    let copy_sidecar = media.downloaded && media.media_file.is_some();
    if copy_sidecar {
        let Some(source) = ctx.db.sources().get_by_id(media.source_id).await? else {
            return Ok(vec![]);
        };
        if source.copy_thumbnails {
            let media_path = ctx
                .config
                .download_root
                .join(media.media_file.as_deref().unwrap_or_default());
            naming::sidecars::copy_thumbnail(&media_path, &fetched.jpeg)
                .await
                .map_err(TaskError::transient)?;
        }
    }

    Ok(vec![])
}
