use std::sync::Arc;

use exam_core::model::{ExamAttempt, ExamId, NewAttempt, UserId};
use storage::repository::{
    AttemptRepository, AttemptSlot, ExamCatalog, QuestionBank, StorageError,
};

use crate::Clock;
use crate::error::AttemptServiceError;

/// Decides whether a user may open a new attempt and creates it.
///
/// The running-attempt and retry checks are not done here: they are part of
/// the storage compare-and-set, so two concurrent starts for the same
/// (user, exam) cannot both succeed.
#[derive(Clone)]
pub struct AttemptArbiter {
    clock: Clock,
    exams: Arc<dyn ExamCatalog>,
    questions: Arc<dyn QuestionBank>,
    attempts: Arc<dyn AttemptRepository>,
}

impl AttemptArbiter {
    #[must_use]
    pub fn new(
        clock: Clock,
        exams: Arc<dyn ExamCatalog>,
        questions: Arc<dyn QuestionBank>,
        attempts: Arc<dyn AttemptRepository>,
    ) -> Self {
        Self {
            clock,
            exams,
            questions,
            attempts,
        }
    }

    /// Open a new in-progress attempt with a frozen copy of the exam paper.
    ///
    /// # Errors
    ///
    /// - `ExamNotFound` if the exam does not exist.
    /// - `ExamNotActive` if it is unpublished or outside its window.
    /// - `AttemptAlreadyInProgress` with the running attempt's id and deadline.
    /// - `RetryLimitExceeded` once every allowed attempt has been used.
    /// - `Snapshot` if a paper question is missing from the bank.
    pub async fn start_attempt(
        &self,
        user_id: UserId,
        exam_id: ExamId,
    ) -> Result<ExamAttempt, AttemptServiceError> {
        let exam = self.exams.get_exam(exam_id).await.map_err(|err| match err {
            StorageError::NotFound => AttemptServiceError::ExamNotFound(exam_id),
            other => AttemptServiceError::Storage(other),
        })?;

        let now = self.clock.now();
        if !exam.is_open_at(now) {
            tracing::debug!(%user_id, %exam_id, status = exam.status().as_str(), "exam closed");
            return Err(AttemptServiceError::ExamNotActive(exam_id));
        }

        let questions = self.questions.get_questions(&exam.question_ids()).await?;
        let attempt = NewAttempt::begin(user_id, &exam, &questions, now)?;

        match self.attempts.create_attempt(attempt, exam.retry_limit()).await? {
            AttemptSlot::Created(attempt) => {
                tracing::info!(
                    attempt_id = %attempt.id(),
                    %user_id,
                    %exam_id,
                    attempt_number = attempt.attempt_number(),
                    deadline = %attempt.deadline(),
                    "attempt started"
                );
                Ok(attempt)
            }
            AttemptSlot::InProgress(existing) => {
                Err(AttemptServiceError::AttemptAlreadyInProgress {
                    attempt_id: existing.id(),
                    deadline: existing.deadline(),
                })
            }
            AttemptSlot::LimitReached { used } => Err(AttemptServiceError::RetryLimitExceeded {
                limit: exam.retry_limit(),
                used,
            }),
        }
    }
}
