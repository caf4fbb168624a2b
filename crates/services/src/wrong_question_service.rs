use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{SeedableRng, rng};
use serde::Serialize;

use exam_core::grading::{self, Mistake};
use exam_core::mastery::{MasteryStatus, WrongQuestionRecord};
use exam_core::model::{ExamId, Question, QuestionId, QuestionType, UserId};
use storage::repository::{
    QuestionBank, StatusFilter, StorageError, WrongQuestionFilter, WrongQuestionRepository,
    WrongQuestionStats,
};

use crate::Clock;
use crate::error::WrongQuestionServiceError;

//
// ─── VIEWS ─────────────────────────────────────────────────────────────────────
//

/// A ledger entry joined with its derived status and the current bank question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WrongQuestionEntry {
    pub record: WrongQuestionRecord,
    pub status: MasteryStatus,
    pub accuracy_rate: f64,
    pub nearly_mastered: bool,
    /// `None` when the question has since been removed from the bank.
    pub question: Option<Question>,
}

impl WrongQuestionEntry {
    fn new(record: WrongQuestionRecord, question: Option<Question>) -> Self {
        Self {
            status: record.mastery_status(),
            accuracy_rate: record.accuracy_rate(),
            nearly_mastered: record.is_nearly_mastered(),
            record,
            question,
        }
    }
}

/// A practice prompt. Carries no answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PracticeItem {
    pub question_id: QuestionId,
    pub question_type: QuestionType,
    pub content: String,
    pub options: Vec<String>,
    pub wrong_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PracticeOutcome {
    pub question_id: QuestionId,
    pub was_correct: bool,
    pub correct_answer: String,
    pub explanation: Option<String>,
    pub status: MasteryStatus,
    pub record: WrongQuestionRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PracticeReport {
    pub outcomes: Vec<PracticeOutcome>,
    pub correct: usize,
    pub total: usize,
}

//
// ─── SERVICE ───────────────────────────────────────────────────────────────────
//

/// Per-user wrong-question ledger: mistakes from exams, practice results,
/// and explicit mastery.
#[derive(Clone)]
pub struct WrongQuestionService {
    clock: Clock,
    ledger: Arc<dyn WrongQuestionRepository>,
    questions: Arc<dyn QuestionBank>,
    shuffle_seed: Option<u64>,
}

impl WrongQuestionService {
    #[must_use]
    pub fn new(
        clock: Clock,
        ledger: Arc<dyn WrongQuestionRepository>,
        questions: Arc<dyn QuestionBank>,
    ) -> Self {
        Self {
            clock,
            ledger,
            questions,
            shuffle_seed: None,
        }
    }

    /// Make practice selection reproducible.
    #[must_use]
    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Fold exam mistakes into the ledger.
    ///
    /// Graded submissions already do this inside the attempt's own
    /// transaction; this entry point is for mistakes found outside an exam
    /// transition, such as manual essay marking.
    ///
    /// # Errors
    ///
    /// Returns `WrongQuestionServiceError::Storage` on write failures.
    pub async fn record_mistakes(
        &self,
        user_id: UserId,
        exam_id: ExamId,
        mistakes: &[Mistake],
    ) -> Result<Vec<WrongQuestionRecord>, WrongQuestionServiceError> {
        if mistakes.is_empty() {
            return Ok(Vec::new());
        }
        let records = self
            .ledger
            .record_mistakes(user_id, exam_id, mistakes, self.clock.now())
            .await?;
        tracing::debug!(%user_id, %exam_id, count = records.len(), "mistakes recorded");
        Ok(records)
    }

    /// Count one practice answer for a question the user previously missed.
    ///
    /// # Errors
    ///
    /// Returns `EntryNotFound` if the question is not in the user's ledger.
    pub async fn record_practice(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        was_correct: bool,
    ) -> Result<WrongQuestionRecord, WrongQuestionServiceError> {
        self.ledger
            .record_practice(user_id, question_id, was_correct, self.clock.now())
            .await
            .map_err(|err| entry_error(user_id, question_id, err))
    }

    /// Mark an entry as mastered. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `EntryNotFound` if the question is not in the user's ledger.
    pub async fn mark_mastered(
        &self,
        user_id: UserId,
        question_id: QuestionId,
    ) -> Result<WrongQuestionRecord, WrongQuestionServiceError> {
        let record = self
            .ledger
            .mark_mastered(user_id, question_id, self.clock.now())
            .await
            .map_err(|err| entry_error(user_id, question_id, err))?;
        tracing::info!(%user_id, %question_id, "question marked mastered");
        Ok(record)
    }

    /// # Errors
    ///
    /// Returns `EntryNotFound` if the question is not in the user's ledger.
    pub async fn mastery_status(
        &self,
        user_id: UserId,
        question_id: QuestionId,
    ) -> Result<MasteryStatus, WrongQuestionServiceError> {
        let record = self.record(user_id, question_id).await?;
        Ok(record.mastery_status())
    }

    /// Attach or clear a personal note. Blank notes clear it.
    ///
    /// # Errors
    ///
    /// Returns `EntryNotFound` if the question is not in the user's ledger.
    pub async fn add_note(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        note: Option<&str>,
    ) -> Result<WrongQuestionRecord, WrongQuestionServiceError> {
        let note = note
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_owned);
        self.ledger
            .set_note(user_id, question_id, note)
            .await
            .map_err(|err| entry_error(user_id, question_id, err))
    }

    /// # Errors
    ///
    /// Returns `EntryNotFound` if the question is not in the user's ledger.
    pub async fn get_wrong_question(
        &self,
        user_id: UserId,
        question_id: QuestionId,
    ) -> Result<WrongQuestionEntry, WrongQuestionServiceError> {
        let record = self.record(user_id, question_id).await?;
        let question = match self.questions.get_question(question_id).await {
            Ok(question) => Some(question),
            Err(StorageError::NotFound) => None,
            Err(err) => return Err(err.into()),
        };
        Ok(WrongQuestionEntry::new(record, question))
    }

    /// Ledger entries matching `filter`, most-missed first.
    ///
    /// # Errors
    ///
    /// Returns `WrongQuestionServiceError::Storage` on read failures.
    pub async fn get_wrong_questions(
        &self,
        user_id: UserId,
        filter: &WrongQuestionFilter,
    ) -> Result<Vec<WrongQuestionEntry>, WrongQuestionServiceError> {
        let records = self.ledger.list_wrong_questions(user_id, filter).await?;
        let mut bank = self.bank_for(&records).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let question = bank.remove(&record.question_id);
                WrongQuestionEntry::new(record, question)
            })
            .collect())
    }

    /// # Errors
    ///
    /// Returns `WrongQuestionServiceError::Storage` on read failures.
    pub async fn statistics(
        &self,
        user_id: UserId,
    ) -> Result<WrongQuestionStats, WrongQuestionServiceError> {
        Ok(self.ledger.statistics(user_id).await?)
    }

    /// Drop every mastered entry; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `WrongQuestionServiceError::Storage` on write failures.
    pub async fn clear_mastered(&self, user_id: UserId) -> Result<u64, WrongQuestionServiceError> {
        let removed = self.ledger.clear_mastered(user_id).await?;
        tracing::info!(%user_id, removed, "mastered entries cleared");
        Ok(removed)
    }

    /// Pick up to `count` unmastered entries at random as practice prompts.
    ///
    /// `filter` narrows the pool; without a status it defaults to unmastered.
    /// Entries whose question was removed or deactivated are skipped.
    ///
    /// # Errors
    ///
    /// Returns `WrongQuestionServiceError::Storage` on read failures.
    pub async fn generate_practice(
        &self,
        user_id: UserId,
        filter: &WrongQuestionFilter,
        count: usize,
    ) -> Result<Vec<PracticeItem>, WrongQuestionServiceError> {
        let pool_filter = WrongQuestionFilter {
            status: Some(filter.status.unwrap_or(StatusFilter::Unmastered)),
            offset: 0,
            limit: None,
            ..filter.clone()
        };

        let mut pool = self
            .ledger
            .list_wrong_questions(user_id, &pool_filter)
            .await?;
        self.shuffle(&mut pool);

        let bank = self.bank_for(&pool).await?;
        let items: Vec<PracticeItem> = pool
            .iter()
            .filter_map(|record| {
                let question = bank.get(&record.question_id)?;
                question.is_available().then(|| PracticeItem {
                    question_id: question.id(),
                    question_type: question.question_type(),
                    content: question.content().to_owned(),
                    options: question.options().to_vec(),
                    wrong_count: record.wrong_count,
                })
            })
            .take(count)
            .collect();

        tracing::debug!(%user_id, pool = pool.len(), picked = items.len(), "practice generated");
        Ok(items)
    }

    /// Grade practice answers against the current bank and record each result.
    ///
    /// Every answer is validated before anything is recorded.
    ///
    /// # Errors
    ///
    /// - `EntryNotFound` if an answered question is not in the user's ledger.
    /// - `QuestionNotFound` if it is no longer in the bank.
    pub async fn submit_practice(
        &self,
        user_id: UserId,
        answers: &BTreeMap<QuestionId, String>,
    ) -> Result<PracticeReport, WrongQuestionServiceError> {
        let mut graded = Vec::with_capacity(answers.len());
        for (question_id, answer) in answers {
            self.record(user_id, *question_id).await?;
            let question = self
                .questions
                .get_question(*question_id)
                .await
                .map_err(|err| match err {
                    StorageError::NotFound => {
                        WrongQuestionServiceError::QuestionNotFound(*question_id)
                    }
                    other => WrongQuestionServiceError::Storage(other),
                })?;
            let was_correct =
                grading::is_correct(question.question_type(), question.correct_answer(), answer);
            graded.push((question, was_correct));
        }

        let mut outcomes = Vec::with_capacity(graded.len());
        for (question, was_correct) in graded {
            let record = self
                .record_practice(user_id, question.id(), was_correct)
                .await?;
            outcomes.push(PracticeOutcome {
                question_id: question.id(),
                was_correct,
                correct_answer: question.correct_answer().to_owned(),
                explanation: question.explanation().map(str::to_owned),
                status: record.mastery_status(),
                record,
            });
        }

        let correct = outcomes.iter().filter(|o| o.was_correct).count();
        tracing::debug!(%user_id, correct, total = outcomes.len(), "practice submitted");
        Ok(PracticeReport {
            total: outcomes.len(),
            correct,
            outcomes,
        })
    }

    async fn record(
        &self,
        user_id: UserId,
        question_id: QuestionId,
    ) -> Result<WrongQuestionRecord, WrongQuestionServiceError> {
        self.ledger
            .get_wrong_question(user_id, question_id)
            .await
            .map_err(|err| entry_error(user_id, question_id, err))
    }

    async fn bank_for(
        &self,
        records: &[WrongQuestionRecord],
    ) -> Result<HashMap<QuestionId, Question>, WrongQuestionServiceError> {
        let ids: Vec<QuestionId> = records.iter().map(|r| r.question_id).collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let questions = self.questions.get_questions(&ids).await?;
        Ok(questions.into_iter().map(|q| (q.id(), q)).collect())
    }

    fn shuffle<T>(&self, items: &mut [T]) {
        match self.shuffle_seed {
            Some(seed) => items.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => items.shuffle(&mut rng()),
        }
    }
}

fn entry_error(
    user_id: UserId,
    question_id: QuestionId,
    err: StorageError,
) -> WrongQuestionServiceError {
    match err {
        StorageError::NotFound => WrongQuestionServiceError::EntryNotFound {
            user_id,
            question_id,
        },
        other => WrongQuestionServiceError::Storage(other),
    }
}
