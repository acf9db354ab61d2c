//! Scheduling outcome taxonomy.
//!
//! Handlers report every non-success outcome as a [`SchedError`]. Only
//! the engine's dispatch loop turns the status into queue transitions.

use serde::Serialize;
use thiserror::Error;

use tabletgrid_state::StateError;

/// Retry policy of a failed scheduling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedStatus {
    /// Transient: release resources, re-enqueue.
    ScheduleRetry,
    /// Work turned out unnecessary or was done by the attempt itself.
    Finished,
    /// Retire the context as CANCELLED.
    Unrecoverable,
    /// Programming error or collaborator failure: retire as UNEXPECTED.
    Unexpected,
}

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("{0}")]
    Retry(String),

    #[error("{0}")]
    Finished(String),

    #[error("{0}")]
    Unrecoverable(String),

    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl SchedError {
    pub fn retry(msg: impl Into<String>) -> Self {
        SchedError::Retry(msg.into())
    }

    pub fn finished(msg: impl Into<String>) -> Self {
        SchedError::Finished(msg.into())
    }

    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        SchedError::Unrecoverable(msg.into())
    }

    pub fn status(&self) -> SchedStatus {
        match self {
            SchedError::Retry(_) => SchedStatus::ScheduleRetry,
            SchedError::Finished(_) => SchedStatus::Finished,
            SchedError::Unrecoverable(_) => SchedStatus::Unrecoverable,
            SchedError::Unexpected(_) => SchedStatus::Unexpected,
        }
    }
}

impl From<StateError> for SchedError {
    fn from(e: StateError) -> Self {
        SchedError::Unexpected(e.to_string())
    }
}

pub type SchedResult<T> = Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(SchedError::retry("path busy").status(), SchedStatus::ScheduleRetry);
        assert_eq!(SchedError::finished("done").status(), SchedStatus::Finished);
        assert_eq!(SchedError::unrecoverable("gone").status(), SchedStatus::Unrecoverable);
        let e: SchedError = StateError::Write("disk full".to_string()).into();
        assert_eq!(e.status(), SchedStatus::Unexpected);
        assert_eq!(e.to_string(), "unexpected: write error: disk full");
    }

    #[test]
    fn message_is_displayed_verbatim() {
        assert_eq!(SchedError::retry("set watermark txn 7").to_string(), "set watermark txn 7");
    }
}
