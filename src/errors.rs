//! Task-level error taxonomy
//!
//! Every background task resolves to one of these variants at its boundary.
//! The scheduler inspects the variant to decide between cancelling, pausing
//! the queue, rescheduling with backoff, or recording a permanent failure.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// The entity was deleted between enqueue and run. Never retried.
    #[error("entity no longer exists: {0}")]
    NotFound(String),

    /// An advisory lock is held elsewhere; reschedule with a short delay.
    #[error("advisory lock unavailable: {0}")]
    Locked(String),

    /// A source listing returned no media at all.
    #[error("source returned no media to index")]
    NoMedia,

    /// The media has no usable format combination.
    #[error("no matching format combination")]
    NoFormat,

    /// A selected format could not be fetched from the site.
    #[error("format {format_id} unavailable: {cause}")]
    FormatUnavailable { format_id: String, cause: String },

    /// Upstream returned an HTTP 429 equivalent; the queue must pause.
    #[error("rate limited by upstream")]
    RateLimited,

    /// The item is a scheduled future broadcast.
    #[error("media premieres at {0}")]
    Premiere(DateTime<Utc>),

    /// The tool reported success but the expected output file is missing.
    #[error("download finished but the output file is missing")]
    DownloadIncomplete,

    /// Anything recoverable; retried with exponential backoff.
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Anything unrecoverable; the entity is flagged and retries stop.
    #[error("permanent failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl TaskError {
    /// Whether the scheduler may retry the task after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::NotFound(_) | TaskError::NoMedia | TaskError::Premiere(_) => false,
            TaskError::Permanent(_) => false,
            TaskError::Locked(_)
            | TaskError::NoFormat
            | TaskError::FormatUnavailable { .. }
            | TaskError::RateLimited
            | TaskError::DownloadIncomplete
            | TaskError::Transient(_) => true,
        }
    }

    pub fn transient<E: Into<anyhow::Error>>(err: E) -> Self {
        TaskError::Transient(err.into())
    }

    pub fn permanent<E: Into<anyhow::Error>>(err: E) -> Self {
        TaskError::Permanent(err.into())
    }
}

impl From<sqlx::Error> for TaskError {
    fn from(err: sqlx::Error) -> Self {
        TaskError::Transient(err.into())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Transient(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!TaskError::NotFound("media".into()).is_retryable());
        assert!(!TaskError::NoMedia.is_retryable());
        assert!(!TaskError::Premiere(Utc::now()).is_retryable());
        assert!(!TaskError::permanent(anyhow::anyhow!("nope")).is_retryable());
        assert!(TaskError::Locked("media:x".into()).is_retryable());
        assert!(TaskError::NoFormat.is_retryable());
        assert!(TaskError::RateLimited.is_retryable());
        assert!(TaskError::DownloadIncomplete.is_retryable());
        assert!(TaskError::transient(anyhow::anyhow!("flaky")).is_retryable());
    }
}
