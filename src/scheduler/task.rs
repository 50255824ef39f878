//! Task definitions
//!
//! A task is a named, JSON-argumented unit of work bound for one of the
//! named queues. Specs carry everything the engine needs to order, retry,
//! deduplicate, expire, and record the run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// The named queues the engine serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskQueue {
    /// Short store transactions
    Db,
    /// Filesystem-heavy work
    Fs,
    /// Network fetches that do not hit the rate-limited site API
    Net,
    /// Rate-limit-sensitive operations that invoke the extractor
    Limit,
}

impl TaskQueue {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskQueue::Db => "db",
            TaskQueue::Fs => "fs",
            TaskQueue::Net => "net",
            TaskQueue::Limit => "limit",
        }
    }

    pub fn all() -> [TaskQueue; 4] {
        [TaskQueue::Db, TaskQueue::Fs, TaskQueue::Net, TaskQueue::Limit]
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Scheduled,
    Running,
    Succeeded,
    FailedRetryable,
    FailedPermanent,
    Revoked,
}

/// Retry policy: attempts are capped and spaced by a polynomial backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_secs: f64,
    pub exponent: f64,
    pub max_interval_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_secs: 60.0,
            exponent: 2.0,
            max_interval_secs: 3600.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before the next attempt: min(max_interval, base * n^exponent)
    pub fn backoff(&self, attempts: u32) -> Duration {
        let n = attempts.max(1) as f64;
        let secs = (self.base_secs * n.powf(self.exponent)).min(self.max_interval_secs);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// What to flag when a task fails permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMark {
    /// Set `has_failed` on the source
    SourceFailed(Uuid),
    /// Set `skip` on the media
    MediaSkip(Uuid),
}

/// Everything needed to enqueue one task
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub args: Value,
    pub queue: TaskQueue,
    /// Higher runs first
    pub priority: i32,
    /// Earliest start, relative to enqueue time
    pub delay: Duration,
    /// Dropped if still queued this long after being scheduled
    pub expires: Option<Duration>,
    pub retry: RetryPolicy,
    /// Human-readable label surfaced in task history
    pub verbose_name: Option<String>,
    /// Drop already-queued tasks with identical (name, args) first
    pub remove_duplicates: bool,
    /// Entity links for history lookups and 429 pause labeling
    pub source_id: Option<Uuid>,
    pub media_id: Option<Uuid>,
    /// Entity flag the engine sets when retries are exhausted
    pub failure_mark: Option<FailureMark>,
}

impl TaskSpec {
    pub fn new(name: &str, args: Value, queue: TaskQueue) -> Self {
        Self {
            name: name.to_string(),
            args,
            queue,
            priority: 50,
            delay: Duration::ZERO,
            expires: None,
            retry: RetryPolicy::default(),
            verbose_name: None,
            remove_duplicates: false,
            source_id: None,
            media_id: None,
            failure_mark: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn verbose_name(mut self, label: impl Into<String>) -> Self {
        self.verbose_name = Some(label.into());
        self
    }

    pub fn remove_duplicates(mut self) -> Self {
        self.remove_duplicates = true;
        self
    }

    pub fn for_source(mut self, source_id: Uuid) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn for_media(mut self, media_id: Uuid) -> Self {
        self.media_id = Some(media_id);
        self
    }

    pub fn failure_mark(mut self, mark: FailureMark) -> Self {
        self.failure_mark = Some(mark);
        self
    }
}

/// A spec sitting in a queue
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub id: Uuid,
    pub spec: TaskSpec,
    pub scheduled_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    /// Transient status note, e.g. "paused (429)"
    pub status: Option<String>,
}

impl PendingTask {
    pub fn new(spec: TaskSpec, now: DateTime<Utc>) -> Self {
        let run_at = now
            + chrono::Duration::from_std(spec.delay).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id: Uuid::new_v4(),
            spec,
            scheduled_at: now,
            run_at,
            attempts: 0,
            status: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.spec.expires {
            Some(expires) => {
                let deadline = self.scheduled_at
                    + chrono::Duration::from_std(expires)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                now > deadline
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            base_secs: 60.0,
            exponent: 2.0,
            max_interval_secs: 3600.0,
        };
        assert_eq!(retry.backoff(1), Duration::from_secs(60));
        assert_eq!(retry.backoff(2), Duration::from_secs(240));
        assert_eq!(retry.backoff(3), Duration::from_secs(540));
        // capped at the max interval
        assert_eq!(retry.backoff(8), Duration::from_secs(3600));
    }

    #[test]
    fn test_pending_task_due_and_expiry() {
        let now = Utc::now();
        let spec = TaskSpec::new("t", json!({}), TaskQueue::Db)
            .delay(Duration::from_secs(30))
            .expires(Duration::from_secs(60));
        let task = PendingTask::new(spec, now);

        assert!(!task.is_due(now));
        assert!(task.is_due(now + chrono::Duration::seconds(31)));
        assert!(!task.is_expired(now + chrono::Duration::seconds(59)));
        assert!(task.is_expired(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_spec_builder() {
        let media_id = Uuid::new_v4();
        let spec = TaskSpec::new("download_media_file", json!({"media_id": media_id}), TaskQueue::Limit)
            .priority(70)
            .delay(Duration::from_secs(60))
            .remove_duplicates()
            .for_media(media_id);

        assert_eq!(spec.priority, 70);
        assert!(spec.remove_duplicates);
        assert_eq!(spec.media_id, Some(media_id));
        assert_eq!(spec.queue.as_str(), "limit");
    }
}
