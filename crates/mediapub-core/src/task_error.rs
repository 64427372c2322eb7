//! Task handler error classification.
//!
//! Handlers return `anyhow::Result<()>`. Wrapping the error in a `TaskError`
//! tells the task bus whether the task may be attempted again. Errors that are
//! not a `TaskError` are treated as retryable.

/// Outcome classification for a failed task attempt.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Transient failure: requeue after the retry delay while budget remains.
    #[error("{0}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure: archive the task, never invoke the handler again.
    #[error("{0} (skip retry)")]
    SkipRetry(#[source] anyhow::Error),
}

impl TaskError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Retryable(err.into())
    }

    pub fn skip_retry(err: impl Into<anyhow::Error>) -> Self {
        TaskError::SkipRetry(err.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, TaskError::Retryable(_))
    }

    /// Returns true when `err` (or anything it wraps) is a skip-retry `TaskError`.
    pub fn is_skip_retry(err: &anyhow::Error) -> bool {
        err.downcast_ref::<TaskError>()
            .map(|te| !te.is_recoverable())
            .unwrap_or(false)
    }
}

/// Convenience conversions for handler code.
pub trait TaskResultExt<T> {
    /// Mark the error as permanent.
    fn skip_retry(self) -> Result<T, anyhow::Error>;

    /// Mark the error as transient.
    fn retryable(self) -> Result<T, anyhow::Error>;
}

impl<T, E> TaskResultExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn skip_retry(self) -> Result<T, anyhow::Error> {
        self.map_err(|e| TaskError::skip_retry(e).into())
    }

    fn retryable(self) -> Result<T, anyhow::Error> {
        self.map_err(|e| TaskError::retryable(e).into())
    }
}
