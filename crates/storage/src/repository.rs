use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exam_core::grading::{self, Mistake, Submission};
use exam_core::mastery::{MasteryStatus, WrongQuestionRecord};
use exam_core::model::{
    AttemptId, AttemptState, ExamAttempt, ExamDefinition, ExamId, NewAttempt, Question,
    QuestionId, UserId, WrongQuestionId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

//
// ─── ATTEMPT OUTCOMES ──────────────────────────────────────────────────────────
//

/// Result of the compare-and-set that creates an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptSlot {
    /// A new in-progress attempt was stored.
    Created(ExamAttempt),
    /// The user already has this attempt in progress for the exam; nothing was written.
    InProgress(ExamAttempt),
    /// The user has used up the exam's retry allowance.
    LimitReached { used: u32 },
}

/// Result of the compare-and-set that moves an attempt out of `InProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Finished,
    /// Another writer got there first; carries the state it left behind.
    AlreadyFinished(AttemptState),
}

/// Result of a guarded draft write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftOutcome {
    /// The attempt as stored after the merge.
    Saved(ExamAttempt),
    AlreadyFinished(AttemptState),
}

//
// ─── LEDGER QUERIES ────────────────────────────────────────────────────────────
//

/// Mastery filter for ledger listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    Mastered,
    Unmastered,
    /// Unmastered entries whose status is `NeedsIntensivePractice`.
    Intensive,
}

impl StatusFilter {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StatusFilter::Mastered => "mastered",
            StatusFilter::Unmastered => "unmastered",
            StatusFilter::Intensive => "intensive",
        }
    }

    #[must_use]
    pub fn matches(self, record: &WrongQuestionRecord) -> bool {
        match self {
            StatusFilter::Mastered => record.mastered,
            StatusFilter::Unmastered => !record.mastered,
            StatusFilter::Intensive => {
                record.mastery_status() == MasteryStatus::NeedsIntensivePractice
            }
        }
    }
}

/// Filters and paging for `WrongQuestionRepository::list_wrong_questions`.
///
/// Difficulty and category are properties of the question, so entries whose
/// question is no longer in the bank never match those filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrongQuestionFilter {
    pub status: Option<StatusFilter>,
    pub difficulty: Option<u8>,
    pub category: Option<String>,
    pub offset: u32,
    pub limit: Option<u32>,
}

impl WrongQuestionFilter {
    #[must_use]
    pub fn with_status(mut self, status: StatusFilter) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_difficulty(mut self, difficulty: u8) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn page(mut self, offset: u32, limit: u32) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// Bucket used for ledger entries whose question has no category.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Aggregate counts over one user's ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrongQuestionStats {
    pub total: u64,
    pub mastered: u64,
    pub unmastered: u64,
    pub needs_intensive_practice: u64,
    pub by_category: BTreeMap<String, u64>,
}

//
// ─── CONTRACTS ─────────────────────────────────────────────────────────────────
//

/// Read access to the question bank, plus the writes used by seeding and tests.
#[async_trait]
pub trait QuestionBank: Send + Sync {
    /// Persist or update a question.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the question cannot be stored.
    async fn upsert_question(&self, question: &Question) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_question(&self, id: QuestionId) -> Result<Question, StorageError>;

    /// Fetch every listed question that exists, read at a single point in time.
    ///
    /// Missing ids are skipped; callers decide whether that is an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on read failures.
    async fn get_questions(&self, ids: &[QuestionId]) -> Result<Vec<Question>, StorageError>;
}

#[async_trait]
pub trait ExamCatalog: Send + Sync {
    /// Persist or replace an exam and its ordered paper.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the exam cannot be stored.
    async fn upsert_exam(&self, exam: &ExamDefinition) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_exam(&self, id: ExamId) -> Result<ExamDefinition, StorageError>;
}

/// Attempt persistence. Every state-changing call is a compare-and-set on
/// the attempt's current state.
#[async_trait]
pub trait AttemptRepository: Send + Sync {
    /// Create an in-progress attempt unless one is already running for the
    /// same (user, exam) or `retry_limit` attempts already exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on write failures.
    async fn create_attempt(
        &self,
        attempt: NewAttempt,
        retry_limit: u32,
    ) -> Result<AttemptSlot, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_attempt(&self, id: AttemptId) -> Result<ExamAttempt, StorageError>;

    /// All attempts for (user, exam), oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on read failures.
    async fn list_attempts(
        &self,
        user_id: UserId,
        exam_id: ExamId,
    ) -> Result<Vec<ExamAttempt>, StorageError>;

    /// Merge `submission` into the stored drafts of an attempt that is still
    /// in progress. Answers replace earlier drafts per question and the cheat
    /// counter only goes up; the merge happens against the stored row, so
    /// concurrent draft saves never drop each other's answers.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` for unknown attempts, or other storage errors.
    async fn save_draft(
        &self,
        id: AttemptId,
        submission: &Submission,
    ) -> Result<DraftOutcome, StorageError>;

    /// Move an attempt into its terminal state and fold `mistakes` into the
    /// user's ledger in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` for unknown attempts, or other storage errors.
    async fn finish_attempt(
        &self,
        finished: &ExamAttempt,
        mistakes: &[Mistake],
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome, StorageError>;

    /// In-progress attempts whose deadline is before `cutoff`, earliest deadline first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on read failures.
    async fn list_overdue(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExamAttempt>, StorageError>;
}

/// The per-user wrong-question ledger. Counters are only ever changed by
/// atomic increments.
#[async_trait]
pub trait WrongQuestionRepository: Send + Sync {
    /// Upsert one entry per mistake: create with `wrong_count = 1`, or bump it.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on write failures.
    async fn record_mistakes(
        &self,
        user_id: UserId,
        exam_id: ExamId,
        mistakes: &[Mistake],
        now: DateTime<Utc>,
    ) -> Result<Vec<WrongQuestionRecord>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the user never got the question wrong.
    async fn record_practice(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        was_correct: bool,
        now: DateTime<Utc>,
    ) -> Result<WrongQuestionRecord, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no entry exists.
    async fn mark_mastered(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        now: DateTime<Utc>,
    ) -> Result<WrongQuestionRecord, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no entry exists.
    async fn set_note(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        note: Option<String>,
    ) -> Result<WrongQuestionRecord, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no entry exists.
    async fn get_wrong_question(
        &self,
        user_id: UserId,
        question_id: QuestionId,
    ) -> Result<WrongQuestionRecord, StorageError>;

    /// Entries matching `filter`, most-missed first, then most recently missed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on read failures.
    async fn list_wrong_questions(
        &self,
        user_id: UserId,
        filter: &WrongQuestionFilter,
    ) -> Result<Vec<WrongQuestionRecord>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on read failures.
    async fn statistics(&self, user_id: UserId) -> Result<WrongQuestionStats, StorageError>;

    /// Delete the user's mastered entries; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on write failures.
    async fn clear_mastered(&self, user_id: UserId) -> Result<u64, StorageError>;

    /// Delete every entry for the user (account removal).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on write failures.
    async fn delete_for_user(&self, user_id: UserId) -> Result<u64, StorageError>;
}

//
// ─── IN-MEMORY ADAPTER ─────────────────────────────────────────────────────────
//

#[derive(Default)]
struct AttemptTable {
    rows: BTreeMap<AttemptId, ExamAttempt>,
    next_id: u64,
}

#[derive(Default)]
struct LedgerTable {
    rows: HashMap<(UserId, QuestionId), WrongQuestionRecord>,
    next_id: u64,
}

impl LedgerTable {
    fn upsert_mistake(
        &mut self,
        user_id: UserId,
        exam_id: ExamId,
        mistake: &Mistake,
        now: DateTime<Utc>,
    ) -> WrongQuestionRecord {
        let key = (user_id, mistake.question_id);
        if let Some(existing) = self.rows.get_mut(&key) {
            existing.record_mistake(mistake.user_answer.clone(), now);
            return existing.clone();
        }
        self.next_id += 1;
        let created = WrongQuestionRecord::first_mistake(
            WrongQuestionId::new(self.next_id),
            user_id,
            mistake.question_id,
            exam_id,
            mistake.user_answer.clone(),
            now,
        );
        self.rows.insert(key, created.clone());
        created
    }
}

/// Simple in-memory repository implementation for testing and prototyping.
///
/// Lock order is attempts before ledger wherever both are held.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    questions: Arc<Mutex<HashMap<QuestionId, Question>>>,
    exams: Arc<Mutex<HashMap<ExamId, ExamDefinition>>>,
    attempts: Arc<Mutex<AttemptTable>>,
    ledger: Arc<Mutex<LedgerTable>>,
}

fn poisoned<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn question_matches(
        &self,
        record: &WrongQuestionRecord,
        filter: &WrongQuestionFilter,
    ) -> Result<bool, StorageError> {
        if filter.difficulty.is_none() && filter.category.is_none() {
            return Ok(true);
        }
        let questions = self.questions.lock().map_err(poisoned)?;
        let Some(question) = questions.get(&record.question_id) else {
            return Ok(false);
        };
        let difficulty_ok = filter.difficulty.is_none_or(|d| question.difficulty() == d);
        let category_ok = filter
            .category
            .as_deref()
            .is_none_or(|c| question.category() == Some(c));
        Ok(difficulty_ok && category_ok)
    }
}

#[async_trait]
impl QuestionBank for InMemoryRepository {
    async fn upsert_question(&self, question: &Question) -> Result<(), StorageError> {
        let mut guard = self.questions.lock().map_err(poisoned)?;
        guard.insert(question.id(), question.clone());
        Ok(())
    }

    async fn get_question(&self, id: QuestionId) -> Result<Question, StorageError> {
        let guard = self.questions.lock().map_err(poisoned)?;
        guard.get(&id).cloned().ok_or(StorageError::NotFound)
    }

    async fn get_questions(&self, ids: &[QuestionId]) -> Result<Vec<Question>, StorageError> {
        let guard = self.questions.lock().map_err(poisoned)?;
        Ok(ids.iter().filter_map(|id| guard.get(id).cloned()).collect())
    }
}

#[async_trait]
impl ExamCatalog for InMemoryRepository {
    async fn upsert_exam(&self, exam: &ExamDefinition) -> Result<(), StorageError> {
        let mut guard = self.exams.lock().map_err(poisoned)?;
        guard.insert(exam.id(), exam.clone());
        Ok(())
    }

    async fn get_exam(&self, id: ExamId) -> Result<ExamDefinition, StorageError> {
        let guard = self.exams.lock().map_err(poisoned)?;
        guard.get(&id).cloned().ok_or(StorageError::NotFound)
    }
}

#[async_trait]
impl AttemptRepository for InMemoryRepository {
    async fn create_attempt(
        &self,
        attempt: NewAttempt,
        retry_limit: u32,
    ) -> Result<AttemptSlot, StorageError> {
        let mut table = self.attempts.lock().map_err(poisoned)?;
        let existing: Vec<&ExamAttempt> = table
            .rows
            .values()
            .filter(|a| a.user_id() == attempt.user_id && a.exam_id() == attempt.exam_id)
            .collect();

        if let Some(running) = existing.iter().find(|a| a.is_in_progress()) {
            return Ok(AttemptSlot::InProgress((*running).clone()));
        }
        let used = u32::try_from(existing.len()).unwrap_or(u32::MAX);
        if used >= retry_limit {
            return Ok(AttemptSlot::LimitReached { used });
        }
        let number = existing
            .iter()
            .map(|a| a.attempt_number())
            .max()
            .unwrap_or(0)
            + 1;

        table.next_id += 1;
        let id = AttemptId::new(table.next_id);
        let created = attempt.assign(id, number);
        table.rows.insert(id, created.clone());
        Ok(AttemptSlot::Created(created))
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<ExamAttempt, StorageError> {
        let table = self.attempts.lock().map_err(poisoned)?;
        table.rows.get(&id).cloned().ok_or(StorageError::NotFound)
    }

    async fn list_attempts(
        &self,
        user_id: UserId,
        exam_id: ExamId,
    ) -> Result<Vec<ExamAttempt>, StorageError> {
        let table = self.attempts.lock().map_err(poisoned)?;
        let mut out: Vec<ExamAttempt> = table
            .rows
            .values()
            .filter(|a| a.user_id() == user_id && a.exam_id() == exam_id)
            .cloned()
            .collect();
        out.sort_by_key(ExamAttempt::attempt_number);
        Ok(out)
    }

    async fn save_draft(
        &self,
        id: AttemptId,
        submission: &Submission,
    ) -> Result<DraftOutcome, StorageError> {
        let mut table = self.attempts.lock().map_err(poisoned)?;
        let current = table.rows.get_mut(&id).ok_or(StorageError::NotFound)?;
        if !current.is_in_progress() {
            return Ok(DraftOutcome::AlreadyFinished(current.state()));
        }
        // Answers outside the snapshot do not fit the stored attempt.
        let drafted =
            grading::save_draft(current, submission).map_err(|_| StorageError::Conflict)?;
        *current = drafted.clone();
        Ok(DraftOutcome::Saved(drafted))
    }

    async fn finish_attempt(
        &self,
        finished: &ExamAttempt,
        mistakes: &[Mistake],
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome, StorageError> {
        if !finished.state().is_terminal() {
            return Err(StorageError::Conflict);
        }
        let mut table = self.attempts.lock().map_err(poisoned)?;
        let current = table
            .rows
            .get_mut(&finished.id())
            .ok_or(StorageError::NotFound)?;
        if !current.is_in_progress() {
            return Ok(FinishOutcome::AlreadyFinished(current.state()));
        }

        let mut ledger = self.ledger.lock().map_err(poisoned)?;
        for mistake in mistakes {
            ledger.upsert_mistake(finished.user_id(), finished.exam_id(), mistake, now);
        }
        *current = finished.clone();
        Ok(FinishOutcome::Finished)
    }

    async fn list_overdue(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExamAttempt>, StorageError> {
        let table = self.attempts.lock().map_err(poisoned)?;
        let mut overdue: Vec<ExamAttempt> = table
            .rows
            .values()
            .filter(|a| a.is_in_progress() && a.is_overdue(cutoff))
            .cloned()
            .collect();
        overdue.sort_by_key(|a| (a.deadline(), a.id()));
        overdue.truncate(limit as usize);
        Ok(overdue)
    }
}

#[async_trait]
impl WrongQuestionRepository for InMemoryRepository {
    async fn record_mistakes(
        &self,
        user_id: UserId,
        exam_id: ExamId,
        mistakes: &[Mistake],
        now: DateTime<Utc>,
    ) -> Result<Vec<WrongQuestionRecord>, StorageError> {
        let mut ledger = self.ledger.lock().map_err(poisoned)?;
        Ok(mistakes
            .iter()
            .map(|m| ledger.upsert_mistake(user_id, exam_id, m, now))
            .collect())
    }

    async fn record_practice(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        was_correct: bool,
        now: DateTime<Utc>,
    ) -> Result<WrongQuestionRecord, StorageError> {
        let mut ledger = self.ledger.lock().map_err(poisoned)?;
        let record = ledger
            .rows
            .get_mut(&(user_id, question_id))
            .ok_or(StorageError::NotFound)?;
        record.record_practice(was_correct, now);
        Ok(record.clone())
    }

    async fn mark_mastered(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        now: DateTime<Utc>,
    ) -> Result<WrongQuestionRecord, StorageError> {
        let mut ledger = self.ledger.lock().map_err(poisoned)?;
        let record = ledger
            .rows
            .get_mut(&(user_id, question_id))
            .ok_or(StorageError::NotFound)?;
        record.mark_mastered(now);
        Ok(record.clone())
    }

    async fn set_note(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        note: Option<String>,
    ) -> Result<WrongQuestionRecord, StorageError> {
        let mut ledger = self.ledger.lock().map_err(poisoned)?;
        let record = ledger
            .rows
            .get_mut(&(user_id, question_id))
            .ok_or(StorageError::NotFound)?;
        record.user_note = note;
        Ok(record.clone())
    }

    async fn get_wrong_question(
        &self,
        user_id: UserId,
        question_id: QuestionId,
    ) -> Result<WrongQuestionRecord, StorageError> {
        let ledger = self.ledger.lock().map_err(poisoned)?;
        ledger
            .rows
            .get(&(user_id, question_id))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn list_wrong_questions(
        &self,
        user_id: UserId,
        filter: &WrongQuestionFilter,
    ) -> Result<Vec<WrongQuestionRecord>, StorageError> {
        let candidates: Vec<WrongQuestionRecord> = {
            let ledger = self.ledger.lock().map_err(poisoned)?;
            ledger
                .rows
                .values()
                .filter(|r| r.user_id == user_id)
                .filter(|r| filter.status.is_none_or(|s| s.matches(r)))
                .cloned()
                .collect()
        };

        let mut out = Vec::with_capacity(candidates.len());
        for record in candidates {
            if self.question_matches(&record, filter)? {
                out.push(record);
            }
        }
        out.sort_by(|a, b| {
            b.wrong_count
                .cmp(&a.wrong_count)
                .then(b.last_wrong_at.cmp(&a.last_wrong_at))
                .then(a.id.cmp(&b.id))
        });

        let limit = filter.limit.map_or(usize::MAX, |l| l as usize);
        Ok(out
            .into_iter()
            .skip(filter.offset as usize)
            .take(limit)
            .collect())
    }

    async fn statistics(&self, user_id: UserId) -> Result<WrongQuestionStats, StorageError> {
        let records: Vec<WrongQuestionRecord> = {
            let ledger = self.ledger.lock().map_err(poisoned)?;
            ledger
                .rows
                .values()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect()
        };
        let questions = self.questions.lock().map_err(poisoned)?;

        let mut stats = WrongQuestionStats::default();
        for record in &records {
            stats.total += 1;
            match record.mastery_status() {
                MasteryStatus::Mastered => stats.mastered += 1,
                MasteryStatus::NeedsIntensivePractice => {
                    stats.unmastered += 1;
                    stats.needs_intensive_practice += 1;
                }
                MasteryStatus::Practicing => stats.unmastered += 1,
            }
            let category = questions
                .get(&record.question_id)
                .and_then(|q| q.category())
                .unwrap_or(UNCATEGORIZED);
            *stats.by_category.entry(category.to_owned()).or_default() += 1;
        }
        Ok(stats)
    }

    async fn clear_mastered(&self, user_id: UserId) -> Result<u64, StorageError> {
        let mut ledger = self.ledger.lock().map_err(poisoned)?;
        let before = ledger.rows.len();
        ledger
            .rows
            .retain(|_, r| !(r.user_id == user_id && r.mastered));
        Ok((before - ledger.rows.len()) as u64)
    }

    async fn delete_for_user(&self, user_id: UserId) -> Result<u64, StorageError> {
        let mut ledger = self.ledger.lock().map_err(poisoned)?;
        let before = ledger.rows.len();
        ledger.rows.retain(|_, r| r.user_id != user_id);
        Ok((before - ledger.rows.len()) as u64)
    }
}

/// Aggregates repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub questions: Arc<dyn QuestionBank>,
    pub exams: Arc<dyn ExamCatalog>,
    pub attempts: Arc<dyn AttemptRepository>,
    pub wrong_questions: Arc<dyn WrongQuestionRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        Self {
            questions: Arc::new(repo.clone()),
            exams: Arc::new(repo.clone()),
            attempts: Arc::new(repo.clone()),
            wrong_questions: Arc::new(repo),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::grading::{self, GradingPolicy, Submission};
    use exam_core::model::{ExamQuestion, QuestionType};
    use exam_core::time::fixed_now;

    fn question(id: u64, category: &str, difficulty: u8) -> Question {
        Question::new(QuestionId::new(id), QuestionType::SingleChoice, format!("Q{id}"), "A")
            .unwrap()
            .with_category(category)
            .with_difficulty(difficulty)
            .unwrap()
    }

    fn exam(retry_limit: u32) -> ExamDefinition {
        ExamDefinition::published(
            ExamId::new(1),
            "Exam",
            30,
            60,
            vec![
                ExamQuestion::new(QuestionId::new(1), 50),
                ExamQuestion::new(QuestionId::new(2), 50),
            ],
        )
        .unwrap()
        .with_retry_limit(retry_limit)
        .unwrap()
    }

    fn new_attempt(user: u64, exam: &ExamDefinition) -> NewAttempt {
        let bank = vec![question(1, "safety", 1), question(2, "safety", 2)];
        NewAttempt::begin(UserId::new(user), exam, &bank, fixed_now()).unwrap()
    }

    fn mistake(id: u64, answer: &str) -> Mistake {
        Mistake {
            question_id: QuestionId::new(id),
            user_answer: Some(answer.into()),
        }
    }

    #[tokio::test]
    async fn second_start_sees_running_attempt() {
        let repo = InMemoryRepository::new();
        let exam = exam(3);

        let first = repo.create_attempt(new_attempt(1, &exam), 3).await.unwrap();
        let AttemptSlot::Created(created) = first else {
            panic!("expected created, got {first:?}");
        };
        assert_eq!(created.attempt_number(), 1);

        let second = repo.create_attempt(new_attempt(1, &exam), 3).await.unwrap();
        assert_eq!(second, AttemptSlot::InProgress(created));
    }

    #[tokio::test]
    async fn retry_limit_counts_finished_attempts() {
        let repo = InMemoryRepository::new();
        let exam = exam(1);
        let AttemptSlot::Created(attempt) =
            repo.create_attempt(new_attempt(1, &exam), 1).await.unwrap()
        else {
            panic!("expected created");
        };
        let done = grading::submit(
            &attempt,
            &Submission::default(),
            &GradingPolicy::default(),
            fixed_now(),
        )
        .unwrap();
        repo.finish_attempt(&done.attempt, &done.mistakes, fixed_now())
            .await
            .unwrap();

        let again = repo.create_attempt(new_attempt(1, &exam), 1).await.unwrap();
        assert_eq!(again, AttemptSlot::LimitReached { used: 1 });
    }

    #[tokio::test]
    async fn finish_is_compare_and_set() {
        let repo = InMemoryRepository::new();
        let exam = exam(1);
        let AttemptSlot::Created(attempt) =
            repo.create_attempt(new_attempt(1, &exam), 1).await.unwrap()
        else {
            panic!("expected created");
        };
        let policy = GradingPolicy::default();
        let submitted = grading::submit(&attempt, &Submission::default(), &policy, fixed_now())
            .unwrap();
        let expired =
            grading::expire(&attempt, &policy, attempt.deadline() + chrono::Duration::seconds(1))
                .unwrap();

        let first = repo
            .finish_attempt(&submitted.attempt, &submitted.mistakes, fixed_now())
            .await
            .unwrap();
        let second = repo
            .finish_attempt(&expired.attempt, &expired.mistakes, fixed_now())
            .await
            .unwrap();

        assert_eq!(first, FinishOutcome::Finished);
        assert_eq!(second, FinishOutcome::AlreadyFinished(AttemptState::Fail));
        let ledger = repo
            .get_wrong_question(UserId::new(1), QuestionId::new(1))
            .await
            .unwrap();
        assert_eq!(ledger.wrong_count, 1);
    }

    #[tokio::test]
    async fn mistakes_increment_existing_entries() {
        let repo = InMemoryRepository::new();
        let user = UserId::new(5);
        repo.record_mistakes(user, ExamId::new(1), &[mistake(1, "B")], fixed_now())
            .await
            .unwrap();
        let later = fixed_now() + chrono::Duration::days(1);
        let updated = repo
            .record_mistakes(user, ExamId::new(2), &[mistake(1, "C")], later)
            .await
            .unwrap();

        assert_eq!(updated[0].wrong_count, 2);
        assert_eq!(updated[0].origin_exam_id, ExamId::new(1));
        assert_eq!(updated[0].last_user_answer.as_deref(), Some("C"));
        assert_eq!(updated[0].last_wrong_at, later);
    }

    #[tokio::test]
    async fn practice_requires_existing_entry() {
        let repo = InMemoryRepository::new();
        let err = repo
            .record_practice(UserId::new(1), QuestionId::new(9), true, fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn listing_filters_and_orders() {
        let repo = InMemoryRepository::new();
        repo.upsert_question(&question(1, "safety", 1)).await.unwrap();
        repo.upsert_question(&question(2, "safety", 3)).await.unwrap();
        repo.upsert_question(&question(3, "math", 3)).await.unwrap();
        let user = UserId::new(1);
        let exam = ExamId::new(1);

        let first_round = [mistake(1, "B"), mistake(2, "B"), mistake(3, "B")];
        repo.record_mistakes(user, exam, &first_round, fixed_now())
            .await
            .unwrap();
        repo.record_mistakes(user, exam, &[mistake(2, "C")], fixed_now())
            .await
            .unwrap();
        repo.mark_mastered(user, QuestionId::new(3), fixed_now())
            .await
            .unwrap();

        let all = repo
            .list_wrong_questions(user, &WrongQuestionFilter::default())
            .await
            .unwrap();
        assert_eq!(all[0].question_id, QuestionId::new(2));
        assert_eq!(all.len(), 3);

        let unmastered_safety = repo
            .list_wrong_questions(
                user,
                &WrongQuestionFilter::default()
                    .with_status(StatusFilter::Unmastered)
                    .with_category("safety")
                    .with_difficulty(3),
            )
            .await
            .unwrap();
        assert_eq!(unmastered_safety.len(), 1);
        assert_eq!(unmastered_safety[0].question_id, QuestionId::new(2));

        let stats = repo.statistics(user).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.mastered, 1);
        assert_eq!(stats.unmastered, 2);
        assert_eq!(stats.by_category.get("safety"), Some(&2));

        assert_eq!(repo.clear_mastered(user).await.unwrap(), 1);
        assert_eq!(repo.delete_for_user(user).await.unwrap(), 2);
    }
}
