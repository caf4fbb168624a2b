use std::sync::Arc;

use exam_core::grading::{self, GradingError, GradingPolicy, Submission, Transition};
use exam_core::model::{AttemptId, ExamAttempt, ExamId, ExamResult, UserId};
use storage::repository::{AttemptRepository, DraftOutcome, FinishOutcome, StorageError};

use crate::Clock;
use crate::error::AttemptServiceError;

/// Grades attempts and persists the `InProgress -> terminal` transition.
///
/// `submit` and `expire` race freely; whichever reaches storage first wins
/// and the other observes `AttemptNotInProgress`.
#[derive(Clone)]
pub struct SessionGrader {
    clock: Clock,
    policy: GradingPolicy,
    attempts: Arc<dyn AttemptRepository>,
}

impl SessionGrader {
    #[must_use]
    pub fn new(clock: Clock, policy: GradingPolicy, attempts: Arc<dyn AttemptRepository>) -> Self {
        Self {
            clock,
            policy,
            attempts,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &GradingPolicy {
        &self.policy
    }

    /// # Errors
    ///
    /// Returns `AttemptNotFound` for unknown ids.
    pub async fn get_attempt(
        &self,
        attempt_id: AttemptId,
    ) -> Result<ExamAttempt, AttemptServiceError> {
        self.attempts
            .get_attempt(attempt_id)
            .await
            .map_err(|err| match err {
                StorageError::NotFound => AttemptServiceError::AttemptNotFound(attempt_id),
                other => AttemptServiceError::Storage(other),
            })
    }

    /// Result view of a finished attempt; `None` while it is still running.
    ///
    /// # Errors
    ///
    /// Returns `AttemptNotFound` for unknown ids.
    pub async fn get_result(
        &self,
        attempt_id: AttemptId,
    ) -> Result<Option<ExamResult>, AttemptServiceError> {
        let attempt = self.get_attempt(attempt_id).await?;
        Ok(ExamResult::from_attempt(&attempt))
    }

    /// Attempt history for one user on one exam, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AttemptServiceError::Storage` on read failures.
    pub async fn list_attempts(
        &self,
        user_id: UserId,
        exam_id: ExamId,
    ) -> Result<Vec<ExamAttempt>, AttemptServiceError> {
        Ok(self.attempts.list_attempts(user_id, exam_id).await?)
    }

    /// Store in-flight answers without grading.
    ///
    /// # Errors
    ///
    /// Returns `AttemptNotInProgress` once the attempt has finished, and
    /// `UnknownQuestion` for answers outside the attempt's snapshot.
    pub async fn save_draft(
        &self,
        attempt_id: AttemptId,
        submission: &Submission,
    ) -> Result<ExamAttempt, AttemptServiceError> {
        let attempt = self.get_attempt(attempt_id).await?;
        grading::validate_draft(&attempt, submission)
            .map_err(|err| grading_error(attempt_id, err))?;

        match self.attempts.save_draft(attempt_id, submission).await? {
            DraftOutcome::Saved(drafted) => {
                tracing::debug!(%attempt_id, drafts = drafted.draft_answers().len(), "draft saved");
                Ok(drafted)
            }
            DraftOutcome::AlreadyFinished(state) => {
                Err(AttemptServiceError::AttemptNotInProgress { attempt_id, state })
            }
        }
    }

    /// Grade the user's answers and close the attempt.
    ///
    /// Submissions arriving after the deadline (plus the policy's grace
    /// period) are closed as `Timeout`.
    ///
    /// # Errors
    ///
    /// - `AttemptNotFound` for unknown ids.
    /// - `AttemptNotInProgress` if the attempt already finished, including when
    ///   a concurrent submit or expiry won the race.
    /// - `UnknownQuestion` for answers outside the attempt's snapshot.
    pub async fn submit(
        &self,
        attempt_id: AttemptId,
        submission: &Submission,
    ) -> Result<ExamResult, AttemptServiceError> {
        let attempt = self.get_attempt(attempt_id).await?;
        let transition = grading::submit(&attempt, submission, &self.policy, self.clock.now())
            .map_err(|err| grading_error(attempt_id, err))?;
        self.commit(transition).await
    }

    /// Close an overdue attempt as `Timeout`, grading its saved drafts.
    ///
    /// # Errors
    ///
    /// - `AttemptNotFound` for unknown ids.
    /// - `AttemptNotInProgress` if the attempt already finished.
    /// - `DeadlineNotReached` while the attempt is still within its time limit
    ///   or the late-submission grace period.
    pub async fn expire(&self, attempt_id: AttemptId) -> Result<ExamResult, AttemptServiceError> {
        let attempt = self.get_attempt(attempt_id).await?;
        let transition = grading::expire(&attempt, &self.policy, self.clock.now())
            .map_err(|err| grading_error(attempt_id, err))?;
        self.commit(transition).await
    }

    async fn commit(&self, transition: Transition) -> Result<ExamResult, AttemptServiceError> {
        let Transition {
            attempt,
            mistakes,
            result,
        } = transition;
        let attempt_id = attempt.id();

        match self
            .attempts
            .finish_attempt(&attempt, &mistakes, self.clock.now())
            .await?
        {
            FinishOutcome::Finished => {
                tracing::info!(
                    %attempt_id,
                    user_id = %attempt.user_id(),
                    state = %attempt.state(),
                    score = attempt.score(),
                    mistakes = mistakes.len(),
                    "attempt finished"
                );
                Ok(result)
            }
            FinishOutcome::AlreadyFinished(state) => {
                tracing::debug!(%attempt_id, %state, "attempt finished concurrently");
                Err(AttemptServiceError::AttemptNotInProgress { attempt_id, state })
            }
        }
    }
}

fn grading_error(attempt_id: AttemptId, err: GradingError) -> AttemptServiceError {
    match err {
        GradingError::NotInProgress(state) => {
            AttemptServiceError::AttemptNotInProgress { attempt_id, state }
        }
        GradingError::UnknownQuestion(question_id) => {
            AttemptServiceError::UnknownQuestion(question_id)
        }
        GradingError::DeadlineNotReached { deadline } => {
            AttemptServiceError::DeadlineNotReached {
                attempt_id,
                deadline,
            }
        }
    }
}
