use std::sync::Arc;

use exam_core::grading::GradingPolicy;
use storage::repository::Storage;

use crate::Clock;
use crate::attempts::{AttemptArbiter, ExpirySweep, SessionGrader};
use crate::error::ExamServicesError;
use crate::wrong_question_service::WrongQuestionService;

/// Assembles the exam services over one storage backend.
#[derive(Clone)]
pub struct ExamServices {
    arbiter: Arc<AttemptArbiter>,
    grader: Arc<SessionGrader>,
    sweep: Arc<ExpirySweep>,
    wrong_questions: Arc<WrongQuestionService>,
}

impl ExamServices {
    /// Build services backed by `SQLite` storage.
    ///
    /// # Errors
    ///
    /// Returns `ExamServicesError` if the connection or migrations fail.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        policy: GradingPolicy,
    ) -> Result<Self, ExamServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        Ok(Self::from_storage(&storage, clock, policy))
    }

    /// Build services over process-local storage.
    #[must_use]
    pub fn in_memory(clock: Clock, policy: GradingPolicy) -> Self {
        Self::from_storage(&Storage::in_memory(), clock, policy)
    }

    #[must_use]
    pub fn from_storage(storage: &Storage, clock: Clock, policy: GradingPolicy) -> Self {
        let arbiter = Arc::new(AttemptArbiter::new(
            clock,
            Arc::clone(&storage.exams),
            Arc::clone(&storage.questions),
            Arc::clone(&storage.attempts),
        ));
        let grader = Arc::new(SessionGrader::new(
            clock,
            policy,
            Arc::clone(&storage.attempts),
        ));
        let sweep = Arc::new(ExpirySweep::new(
            clock,
            Arc::clone(&grader),
            Arc::clone(&storage.attempts),
        ));
        let wrong_questions = Arc::new(WrongQuestionService::new(
            clock,
            Arc::clone(&storage.wrong_questions),
            Arc::clone(&storage.questions),
        ));

        Self {
            arbiter,
            grader,
            sweep,
            wrong_questions,
        }
    }

    #[must_use]
    pub fn arbiter(&self) -> Arc<AttemptArbiter> {
        Arc::clone(&self.arbiter)
    }

    #[must_use]
    pub fn grader(&self) -> Arc<SessionGrader> {
        Arc::clone(&self.grader)
    }

    #[must_use]
    pub fn sweep(&self) -> Arc<ExpirySweep> {
        Arc::clone(&self.sweep)
    }

    #[must_use]
    pub fn wrong_questions(&self) -> Arc<WrongQuestionService> {
        Arc::clone(&self.wrong_questions)
    }
}
