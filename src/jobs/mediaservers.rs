//! Media server rescan task

use std::sync::Arc;

use tracing::info;

use crate::context::ServiceContext;
use crate::errors::TaskError;
use crate::scheduler::{HandlerResult, TaskRun};
use crate::services::mediaservers::media_server_client;

use super::uuid_arg;

pub async fn run(ctx: Arc<ServiceContext>, run: TaskRun) -> HandlerResult {
    let server_id = uuid_arg(&run.args, "server_id")?;
    let Some(server) = ctx.db.media_servers().get_by_id(server_id).await? else {
        return Err(TaskError::NotFound(format!("media server {server_id}")));
    };

    info!(server = %server.base_url(), "Updating media server");
    let client = media_server_client(server).map_err(TaskError::permanent)?;
    client.update().await.map_err(TaskError::transient)?;

    Ok(vec![])
}
