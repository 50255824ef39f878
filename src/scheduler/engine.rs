//! Task engine
//!
//! Named queues served by small worker pools. A dispatcher per queue
//! enforces (priority desc, scheduled_at asc) ordering over due tasks,
//! honors revocation and expiry at pickup, deduplicates on enqueue, pauses
//! the whole queue on rate-limit failures, and records every terminal
//! outcome in task history. Follow-up tasks returned by handlers are
//! enqueued after the handler commits, keeping side effects explicit.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::ServiceContext;
use crate::db::task_history::RecordTaskRun;
use crate::db::{Database, TaskOutcome};
use crate::errors::TaskError;

use super::task::{FailureMark, PendingTask, TaskQueue, TaskSpec};

/// Result of one handler invocation: follow-up tasks to enqueue
pub type HandlerResult = Result<Vec<TaskSpec>, TaskError>;

/// Maps a failure to remedial tasks, e.g. a format refresh after
/// `NoFormat`. Keeps the engine free of task-name knowledge.
pub type FailureRouter = Box<dyn Fn(&TaskError, &TaskSpec) -> Vec<TaskSpec> + Send + Sync>;

type BoxedHandler =
    Arc<dyn Fn(Arc<ServiceContext>, TaskRun) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Handle a running task body uses to publish progress and poll revocation
#[derive(Clone)]
pub struct TaskHandle {
    id: Uuid,
    labels: Arc<Mutex<HashMap<Uuid, String>>>,
    revoked: Arc<Mutex<HashSet<Uuid>>>,
}

impl TaskHandle {
    /// Update the task's visible label, e.g. with "n/total" progress
    pub fn set_progress(&self, label: impl Into<String>) {
        self.labels.lock().insert(self.id, label.into());
    }

    /// Bodies should poll this at natural suspension points and bail out
    pub fn is_revoked(&self) -> bool {
        self.revoked.lock().contains(&self.id)
    }
}

/// What a handler receives for one run
pub struct TaskRun {
    pub id: Uuid,
    pub args: Value,
    pub handle: TaskHandle,
}

/// Handler registry mapping task names to bodies
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Arc<ServiceContext>, TaskRun) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.handlers.insert(
            name.to_string(),
            Arc::new(move |ctx, run| {
                let handler = handler.clone();
                Box::pin(handler(ctx, run))
            }),
        );
    }

    fn get(&self, name: &str) -> Option<BoxedHandler> {
        self.handlers.get(name).cloned()
    }
}

/// Worker counts and shutdown sentinels
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_workers: usize,
    pub fs_workers: usize,
    pub net_workers: usize,
    pub limit_workers: usize,
    pub db_shutdown_sentinel: PathBuf,
    pub fs_shutdown_sentinel: PathBuf,
}

struct QueueState {
    queue: TaskQueue,
    pending: Mutex<Vec<PendingTask>>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    paused_until: Mutex<Option<DateTime<Utc>>>,
    rate_limit_hits: AtomicUsize,
}

pub struct TaskEngine {
    queues: HashMap<TaskQueue, Arc<QueueState>>,
    registry: TaskRegistry,
    db: Database,
    config: EngineConfig,
    revoked: Arc<Mutex<HashSet<Uuid>>>,
    running_labels: Arc<Mutex<HashMap<Uuid, String>>>,
    stopping: AtomicBool,
    failure_router: Option<FailureRouter>,
}

impl TaskEngine {
    pub fn new(
        db: Database,
        config: EngineConfig,
        registry: TaskRegistry,
        failure_router: Option<FailureRouter>,
    ) -> Arc<Self> {
        let mut queues = HashMap::new();
        for queue in TaskQueue::all() {
            let workers = match queue {
                TaskQueue::Db => config.db_workers,
                TaskQueue::Fs => config.fs_workers,
                TaskQueue::Net => config.net_workers,
                TaskQueue::Limit => config.limit_workers,
            };
            queues.insert(
                queue,
                Arc::new(QueueState {
                    queue,
                    pending: Mutex::new(Vec::new()),
                    notify: Notify::new(),
                    semaphore: Arc::new(Semaphore::new(workers.max(1))),
                    paused_until: Mutex::new(None),
                    rate_limit_hits: AtomicUsize::new(0),
                }),
            );
        }
        Arc::new(Self {
            queues,
            registry,
            db,
            config,
            revoked: Arc::new(Mutex::new(HashSet::new())),
            running_labels: Arc::new(Mutex::new(HashMap::new())),
            stopping: AtomicBool::new(false),
            failure_router,
        })
    }

    /// Spawn one dispatcher per queue
    pub fn start(self: &Arc<Self>, ctx: Arc<ServiceContext>) {
        for state in self.queues.values() {
            let engine = self.clone();
            let ctx = ctx.clone();
            let state = state.clone();
            tokio::spawn(async move {
                info!(queue = state.queue.as_str(), "Task queue dispatcher started");
                engine.dispatch_loop(state, ctx).await;
            });
        }
    }

    /// Put a task on its queue, deduplicating when asked. Returns the id.
    pub fn enqueue(&self, spec: TaskSpec) -> Uuid {
        let state = &self.queues[&spec.queue];
        let mut pending = state.pending.lock();
        if spec.remove_duplicates {
            let before = pending.len();
            pending.retain(|task| !(task.spec.name == spec.name && task.spec.args == spec.args));
            if pending.len() < before {
                debug!(task = %spec.name, "Dropped duplicate queued task");
            }
        }
        let task = PendingTask::new(spec, Utc::now());
        let id = task.id;
        debug!(task = %task.spec.name, task_id = %id, queue = state.queue.as_str(), "Task enqueued");
        pending.push(task);
        drop(pending);
        state.notify.notify_one();
        id
    }

    /// Revoke a task by id; honored at pickup, and running bodies see it
    /// through their handle.
    pub fn revoke(&self, id: Uuid) {
        self.revoked.lock().insert(id);
    }

    /// Number of queued tasks on a queue
    pub fn queue_len(&self, queue: TaskQueue) -> usize {
        self.queues[&queue].pending.lock().len()
    }

    /// Labels of currently running tasks, for status surfaces
    pub fn running_tasks(&self) -> Vec<(Uuid, String)> {
        self.running_labels
            .lock()
            .iter()
            .map(|(id, label)| (*id, label.clone()))
            .collect()
    }

    /// Queued tasks on a queue with any transient status note, e.g.
    /// "paused (429)"
    pub fn queued_tasks(&self, queue: TaskQueue) -> Vec<(Uuid, String, Option<String>)> {
        self.queues[&queue]
            .pending
            .lock()
            .iter()
            .map(|task| (task.id, task.spec.name.clone(), task.status.clone()))
            .collect()
    }

    /// Stop dispatchers at their next pickup
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for state in self.queues.values() {
            state.notify.notify_one();
        }
    }

    /// Both sentinel files present means the process is being torn down
    pub fn shutdown_requested(&self) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            return true;
        }
        self.config.db_shutdown_sentinel.exists() && self.config.fs_shutdown_sentinel.exists()
    }

    /// Mark a media item's queued tasks with a pause note and stall the
    /// queue for 10 seconds per recorded rate-limit hit.
    pub fn pause_for_rate_limit(&self, queue: TaskQueue, media_id: Option<Uuid>) {
        let state = &self.queues[&queue];
        let hits = state.rate_limit_hits.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = chrono::Duration::seconds(10 * hits as i64);
        let until = Utc::now() + delay;
        *state.paused_until.lock() = Some(until);

        if let Some(media_id) = media_id {
            for queue_state in self.queues.values() {
                let mut pending = queue_state.pending.lock();
                for task in pending.iter_mut() {
                    if task.spec.media_id == Some(media_id) {
                        task.status = Some("paused (429)".to_string());
                    }
                }
            }
        }
        warn!(
            queue = queue.as_str(),
            hits,
            until = %until,
            "Rate limited; pausing queue"
        );
    }

    async fn dispatch_loop(self: Arc<Self>, state: Arc<QueueState>, ctx: Arc<ServiceContext>) {
        loop {
            if self.shutdown_requested() {
                info!(queue = state.queue.as_str(), "Task queue dispatcher stopping");
                return;
            }

            // Rate-limit pause: sleep in short slices so shutdown can
            // preempt the wait.
            let paused = *state.paused_until.lock();
            if let Some(until) = paused {
                if Utc::now() < until {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                *state.paused_until.lock() = None;
                state.rate_limit_hits.store(0, Ordering::SeqCst);
            }

            let now = Utc::now();
            let next = {
                let mut pending = state.pending.lock();
                select_next(&mut pending, now)
            };

            let Some(task) = next else {
                // Wake when something is enqueued or the nearest delayed
                // task becomes due.
                let wait = {
                    let pending = state.pending.lock();
                    pending
                        .iter()
                        .map(|t| (t.run_at - now).num_milliseconds().max(0) as u64)
                        .min()
                        .unwrap_or(5_000)
                        .min(5_000)
                };
                let _ = tokio::time::timeout(
                    Duration::from_millis(wait.max(100)),
                    state.notify.notified(),
                )
                .await;
                continue;
            };

            if self.revoked.lock().remove(&task.id) {
                debug!(task = %task.spec.name, task_id = %task.id, "Dropping revoked task");
                self.record_outcome(&task, TaskOutcome::Revoked, None, None).await;
                continue;
            }
            if task.is_expired(now) {
                debug!(task = %task.spec.name, task_id = %task.id, "Dropping expired task");
                self.record_outcome(&task, TaskOutcome::Expired, None, None).await;
                continue;
            }

            let permit = match state.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let engine = self.clone();
            let ctx = ctx.clone();
            let queue_state = state.clone();
            tokio::spawn(async move {
                engine.run_task(queue_state, ctx, task).await;
                drop(permit);
            });
        }
    }

    async fn run_task(
        self: Arc<Self>,
        state: Arc<QueueState>,
        ctx: Arc<ServiceContext>,
        mut task: PendingTask,
    ) {
        let Some(handler) = self.registry.get(&task.spec.name) else {
            error!(task = %task.spec.name, "No handler registered for task");
            self.record_outcome(&task, TaskOutcome::FailedPermanent, Some("no handler registered"), None)
                .await;
            return;
        };

        task.attempts += 1;
        let started_at = Utc::now();
        let label = task
            .spec
            .verbose_name
            .clone()
            .unwrap_or_else(|| task.spec.name.clone());
        self.running_labels.lock().insert(task.id, label);

        let run = TaskRun {
            id: task.id,
            args: task.spec.args.clone(),
            handle: TaskHandle {
                id: task.id,
                labels: self.running_labels.clone(),
                revoked: self.revoked.clone(),
            },
        };

        debug!(task = %task.spec.name, task_id = %task.id, attempt = task.attempts, "Task starting");
        let result = handler(ctx.clone(), run).await;
        self.running_labels.lock().remove(&task.id);
        self.revoked.lock().remove(&task.id);

        match result {
            Ok(follow_ups) => {
                debug!(task = %task.spec.name, task_id = %task.id, "Task succeeded");
                self.record_outcome(&task, TaskOutcome::Succeeded, None, Some(started_at))
                    .await;
                for spec in follow_ups {
                    self.enqueue(spec);
                }
            }
            Err(err) => {
                self.handle_failure(&state, task, err, started_at).await;
            }
        }
    }

    async fn handle_failure(
        &self,
        state: &Arc<QueueState>,
        mut task: PendingTask,
        err: TaskError,
        started_at: DateTime<Utc>,
    ) {
        let error_text = err.to_string();

        if matches!(err, TaskError::RateLimited) {
            self.pause_for_rate_limit(state.queue, task.spec.media_id);
        }

        if let Some(router) = &self.failure_router {
            for spec in router(&err, &task.spec) {
                self.enqueue(spec);
            }
        }

        // Lock contention is not a real failure: reschedule soon without
        // consuming an attempt or writing history.
        if let TaskError::Locked(what) = &err {
            debug!(task = %task.spec.name, task_id = %task.id, lock = %what, "Task rescheduled around a held lock");
            task.attempts = task.attempts.saturating_sub(1);
            task.run_at = Utc::now() + chrono::Duration::seconds(10);
            task.status = None;
            let mut pending = state.pending.lock();
            pending.push(task);
            drop(pending);
            state.notify.notify_one();
            return;
        }

        let can_retry = err.is_retryable() && task.attempts < task.spec.retry.max_attempts;
        if can_retry {
            warn!(
                task = %task.spec.name,
                task_id = %task.id,
                attempt = task.attempts,
                error = %error_text,
                "Task failed, will retry"
            );
            self.record_outcome(&task, TaskOutcome::FailedRetryable, Some(&error_text), Some(started_at))
                .await;

            let backoff = task.spec.retry.backoff(task.attempts);
            task.run_at = Utc::now()
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
            task.status = None;
            let mut pending = state.pending.lock();
            pending.push(task);
            drop(pending);
            state.notify.notify_one();
            return;
        }

        error!(
            task = %task.spec.name,
            task_id = %task.id,
            attempts = task.attempts,
            error = %error_text,
            "Task failed permanently"
        );
        if let Some(mark) = task.spec.failure_mark {
            self.apply_failure_mark(mark).await;
        }
        self.record_outcome(&task, TaskOutcome::FailedPermanent, Some(&error_text), Some(started_at))
            .await;
    }

    async fn apply_failure_mark(&self, mark: FailureMark) {
        let result = match mark {
            FailureMark::SourceFailed(source_id) => {
                self.db.sources().set_has_failed(source_id, true).await
            }
            FailureMark::MediaSkip(media_id) => {
                match self.db.media().get_by_id(media_id).await {
                    Ok(Some(media)) => {
                        self.db
                            .media()
                            .update_skip_flags(media_id, true, media.manual_skip)
                            .await
                    }
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to apply permanent-failure mark");
        }
    }

    async fn record_outcome(
        &self,
        task: &PendingTask,
        outcome: TaskOutcome,
        last_error: Option<&str>,
        started_at: Option<DateTime<Utc>>,
    ) {
        let run = RecordTaskRun {
            task_name: task.spec.name.clone(),
            args: task.spec.args.clone(),
            queue: task.spec.queue.as_str().to_string(),
            verbose_name: task.spec.verbose_name.clone(),
            source_id: task.spec.source_id,
            media_id: task.spec.media_id,
            scheduled_at: task.scheduled_at,
            started_at,
            attempts: task.attempts as i32,
            outcome,
            last_error: last_error.map(str::to_string),
        };
        if let Err(e) = self.db.task_history().record(run).await {
            error!(error = %e, task = %task.spec.name, "Failed to record task history");
        }
    }
}

/// Remove and return the best due task: highest priority first, then the
/// earliest scheduled. Tasks with a future `run_at` are not eligible.
fn select_next(pending: &mut Vec<PendingTask>, now: DateTime<Utc>) -> Option<PendingTask> {
    let mut best: Option<usize> = None;
    for (idx, task) in pending.iter().enumerate() {
        if !task.is_due(now) {
            continue;
        }
        match best {
            None => best = Some(idx),
            Some(current) => {
                let cur = &pending[current];
                let better = task.spec.priority > cur.spec.priority
                    || (task.spec.priority == cur.spec.priority
                        && task.scheduled_at < cur.scheduled_at);
                if better {
                    best = Some(idx);
                }
            }
        }
    }
    best.map(|idx| pending.remove(idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskSpec;
    use serde_json::json;

    fn pending(name: &str, priority: i32, now: DateTime<Utc>, offset_secs: i64) -> PendingTask {
        let spec = TaskSpec::new(name, json!({}), TaskQueue::Db).priority(priority);
        let mut task = PendingTask::new(spec, now + chrono::Duration::seconds(offset_secs));
        task.run_at = task.scheduled_at;
        task
    }

    #[test]
    fn test_select_next_priority_then_fifo() {
        let now = Utc::now();
        let mut queue = vec![
            pending("low-old", 10, now, -30),
            pending("high-new", 90, now, -5),
            pending("high-old", 90, now, -20),
        ];

        let first = select_next(&mut queue, now).unwrap();
        assert_eq!(first.spec.name, "high-old");
        let second = select_next(&mut queue, now).unwrap();
        assert_eq!(second.spec.name, "high-new");
        let third = select_next(&mut queue, now).unwrap();
        assert_eq!(third.spec.name, "low-old");
        assert!(select_next(&mut queue, now).is_none());
    }

    #[test]
    fn test_select_next_skips_delayed_tasks() {
        let now = Utc::now();
        let spec = TaskSpec::new("later", json!({}), TaskQueue::Db)
            .delay(Duration::from_secs(300));
        let mut queue = vec![PendingTask::new(spec, now)];

        assert!(select_next(&mut queue, now).is_none());
        assert_eq!(queue.len(), 1);

        let later = now + chrono::Duration::seconds(301);
        assert!(select_next(&mut queue, later).is_some());
    }
}
