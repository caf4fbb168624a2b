//! Shared error types for the services crate.

use chrono::{DateTime, Utc};
use thiserror::Error;

use exam_core::ErrorKind;
use exam_core::model::{AttemptError, AttemptId, AttemptState, ExamId, QuestionId, UserId};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

fn storage_kind(err: &StorageError) -> ErrorKind {
    match err {
        StorageError::NotFound => ErrorKind::NotFound,
        StorageError::Conflict => ErrorKind::InvalidState,
        _ => ErrorKind::Internal,
    }
}

/// Errors emitted by the attempt lifecycle (`AttemptArbiter`, `SessionGrader`, `ExpirySweep`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttemptServiceError {
    #[error("exam {0} not found")]
    ExamNotFound(ExamId),

    #[error("exam {0} is not open for attempts")]
    ExamNotActive(ExamId),

    #[error("attempt {attempt_id} is already in progress (deadline {deadline})")]
    AttemptAlreadyInProgress {
        attempt_id: AttemptId,
        deadline: DateTime<Utc>,
    },

    #[error("retry limit reached: {used} of {limit} attempts used")]
    RetryLimitExceeded { limit: u32, used: u32 },

    #[error("attempt {0} not found")]
    AttemptNotFound(AttemptId),

    #[error("attempt {attempt_id} is not in progress (state: {state})")]
    AttemptNotInProgress {
        attempt_id: AttemptId,
        state: AttemptState,
    },

    #[error("attempt {attempt_id} runs until {deadline}")]
    DeadlineNotReached {
        attempt_id: AttemptId,
        deadline: DateTime<Utc>,
    },

    #[error("question {0} is not part of this attempt")]
    UnknownQuestion(QuestionId),

    #[error(transparent)]
    Snapshot(#[from] AttemptError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AttemptServiceError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ExamNotFound(_) | Self::AttemptNotFound(_) => ErrorKind::NotFound,
            Self::ExamNotActive(_)
            | Self::AttemptAlreadyInProgress { .. }
            | Self::RetryLimitExceeded { .. }
            | Self::DeadlineNotReached { .. } => ErrorKind::PolicyViolation,
            Self::AttemptNotInProgress { .. } => ErrorKind::InvalidState,
            Self::UnknownQuestion(_) => ErrorKind::Validation,
            Self::Snapshot(AttemptError::MissingQuestion(_)) => ErrorKind::NotFound,
            Self::Snapshot(_) => ErrorKind::Validation,
            Self::Storage(err) => storage_kind(err),
        }
    }
}

/// Errors emitted by `WrongQuestionService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WrongQuestionServiceError {
    #[error("user {user_id} has no wrong-question entry for question {question_id}")]
    EntryNotFound {
        user_id: UserId,
        question_id: QuestionId,
    },

    #[error("question {0} not found")]
    QuestionNotFound(QuestionId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl WrongQuestionServiceError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EntryNotFound { .. } | Self::QuestionNotFound(_) => ErrorKind::NotFound,
            Self::Storage(err) => storage_kind(err),
        }
    }
}

/// Errors emitted while bootstrapping `ExamServices`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExamServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_conflicts_are_distinguishable_from_state_errors() {
        let running = AttemptServiceError::AttemptAlreadyInProgress {
            attempt_id: AttemptId::new(1),
            deadline: exam_core::time::fixed_now(),
        };
        assert_eq!(running.kind(), ErrorKind::PolicyViolation);

        let finished = AttemptServiceError::AttemptNotInProgress {
            attempt_id: AttemptId::new(1),
            state: AttemptState::Pass,
        };
        assert_eq!(finished.kind(), ErrorKind::InvalidState);

        let missing = AttemptServiceError::Snapshot(AttemptError::MissingQuestion(
            QuestionId::new(4),
        ));
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(
            AttemptServiceError::Storage(StorageError::Connection("down".into())).kind(),
            ErrorKind::Internal
        );
    }
}
