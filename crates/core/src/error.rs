use thiserror::Error;

use crate::model::{AttemptError, ExamError, QuestionError};

/// Coarse failure classes shared by every layer.
///
/// Callers branch on the kind (e.g. to offer "resume" on a policy conflict)
/// without matching each concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Exam, question, attempt, or ledger entry is absent.
    NotFound,
    /// Operation against an attempt that is no longer in progress.
    InvalidState,
    /// Retry limit, time window, or an attempt already in progress.
    PolicyViolation,
    /// Malformed input, e.g. an answer for a question outside the attempt.
    Validation,
    /// Storage or infrastructure failure.
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Question(#[from] QuestionError),
    #[error(transparent)]
    Exam(#[from] ExamError),
    #[error(transparent)]
    Attempt(#[from] AttemptError),
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Question(_) | Error::Exam(_) => ErrorKind::Validation,
            Error::Attempt(AttemptError::MissingQuestion(_)) => ErrorKind::NotFound,
            Error::Attempt(_) => ErrorKind::Validation,
        }
    }
}
