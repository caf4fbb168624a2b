use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::model::ids::{ExamId, QuestionId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExamError {
    #[error("exam title cannot be empty")]
    EmptyTitle,

    #[error("exam duration must be > 0 minutes")]
    InvalidDuration,

    #[error("pass score ({pass}) exceeds total score ({total})")]
    PassScoreAboveTotal { pass: u32, total: u32 },

    #[error("retry limit must be at least 1")]
    InvalidRetryLimit,

    #[error("start window is after end window")]
    InvalidWindow,

    #[error("exam must contain at least one question")]
    NoQuestions,

    #[error("question {0} appears more than once")]
    DuplicateQuestion(QuestionId),

    #[error("unknown exam status: {0}")]
    UnknownStatus(String),
}

//
// ─── STATUS ────────────────────────────────────────────────────────────────────
//

/// Publication status of an exam. Only published exams accept new attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamStatus {
    #[default]
    Draft,
    Published,
    Ended,
    Cancelled,
}

impl ExamStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExamStatus::Draft => "draft",
            ExamStatus::Published => "published",
            ExamStatus::Ended => "ended",
            ExamStatus::Cancelled => "cancelled",
        }
    }

    /// # Errors
    ///
    /// Returns `ExamError::UnknownStatus` for unrecognised values.
    pub fn parse(value: &str) -> Result<Self, ExamError> {
        match value {
            "draft" => Ok(ExamStatus::Draft),
            "published" => Ok(ExamStatus::Published),
            "ended" => Ok(ExamStatus::Ended),
            "cancelled" => Ok(ExamStatus::Cancelled),
            other => Err(ExamError::UnknownStatus(other.to_owned())),
        }
    }
}

//
// ─── DEFINITION ────────────────────────────────────────────────────────────────
//

/// One slot in an exam paper: which question, and what it is worth here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamQuestion {
    pub question_id: QuestionId,
    pub score: u32,
}

impl ExamQuestion {
    #[must_use]
    pub fn new(question_id: QuestionId, score: u32) -> Self {
        Self { question_id, score }
    }
}

/// Exam configuration as read from the catalog.
///
/// Read-only to the attempt lifecycle; an attempt copies what it needs at
/// start so later edits never change how it is graded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamDefinition {
    id: ExamId,
    title: String,
    duration_minutes: u32,
    total_score: u32,
    pass_score: u32,
    start_window: Option<DateTime<Utc>>,
    end_window: Option<DateTime<Utc>>,
    retry_limit: u32,
    status: ExamStatus,
    questions: Vec<ExamQuestion>,
}

impl ExamDefinition {
    /// Build and validate an exam definition.
    ///
    /// # Errors
    ///
    /// Returns an `ExamError` describing the first violated rule.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ExamId,
        title: impl Into<String>,
        duration_minutes: u32,
        total_score: u32,
        pass_score: u32,
        start_window: Option<DateTime<Utc>>,
        end_window: Option<DateTime<Utc>>,
        retry_limit: u32,
        status: ExamStatus,
        questions: Vec<ExamQuestion>,
    ) -> Result<Self, ExamError> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(ExamError::EmptyTitle);
        }
        if duration_minutes == 0 {
            return Err(ExamError::InvalidDuration);
        }
        if pass_score > total_score {
            return Err(ExamError::PassScoreAboveTotal {
                pass: pass_score,
                total: total_score,
            });
        }
        if retry_limit == 0 {
            return Err(ExamError::InvalidRetryLimit);
        }
        if let (Some(start), Some(end)) = (start_window, end_window) {
            if start > end {
                return Err(ExamError::InvalidWindow);
            }
        }
        if questions.is_empty() {
            return Err(ExamError::NoQuestions);
        }
        let mut seen = HashSet::with_capacity(questions.len());
        for q in &questions {
            if !seen.insert(q.question_id) {
                return Err(ExamError::DuplicateQuestion(q.question_id));
            }
        }

        Ok(Self {
            id,
            title,
            duration_minutes,
            total_score,
            pass_score,
            start_window,
            end_window,
            retry_limit,
            status,
            questions,
        })
    }

    /// Open-ended, published exam with a single allowed attempt.
    ///
    /// # Errors
    ///
    /// Same as `ExamDefinition::new`.
    pub fn published(
        id: ExamId,
        title: impl Into<String>,
        duration_minutes: u32,
        pass_score: u32,
        questions: Vec<ExamQuestion>,
    ) -> Result<Self, ExamError> {
        let total = questions.iter().map(|q| q.score).sum();
        Self::new(
            id,
            title,
            duration_minutes,
            total,
            pass_score,
            None,
            None,
            1,
            ExamStatus::Published,
            questions,
        )
    }

    /// # Errors
    ///
    /// Returns `ExamError::InvalidWindow` if `start` is after `end`.
    pub fn with_window(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Self, ExamError> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(ExamError::InvalidWindow);
            }
        }
        self.start_window = start;
        self.end_window = end;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns `ExamError::InvalidRetryLimit` for zero.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Result<Self, ExamError> {
        if retry_limit == 0 {
            return Err(ExamError::InvalidRetryLimit);
        }
        self.retry_limit = retry_limit;
        Ok(self)
    }

    #[must_use]
    pub fn with_status(mut self, status: ExamStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn id(&self) -> ExamId {
        self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    #[must_use]
    pub fn total_score(&self) -> u32 {
        self.total_score
    }

    #[must_use]
    pub fn pass_score(&self) -> u32 {
        self.pass_score
    }

    #[must_use]
    pub fn start_window(&self) -> Option<DateTime<Utc>> {
        self.start_window
    }

    #[must_use]
    pub fn end_window(&self) -> Option<DateTime<Utc>> {
        self.end_window
    }

    #[must_use]
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    #[must_use]
    pub fn status(&self) -> ExamStatus {
        self.status
    }

    #[must_use]
    pub fn questions(&self) -> &[ExamQuestion] {
        &self.questions
    }

    #[must_use]
    pub fn question_ids(&self) -> Vec<QuestionId> {
        self.questions.iter().map(|q| q.question_id).collect()
    }

    /// Whether `now` falls inside the time window (bounds inclusive).
    #[must_use]
    pub fn window_contains(&self, now: DateTime<Utc>) -> bool {
        self.start_window.is_none_or(|start| now >= start)
            && self.end_window.is_none_or(|end| now <= end)
    }

    /// Whether a new attempt may begin at `now`.
    #[must_use]
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ExamStatus::Published && self.window_contains(now)
    }

    /// Deadline for an attempt that started at `started_at`.
    #[must_use]
    pub fn deadline_for(&self, started_at: DateTime<Utc>) -> DateTime<Utc> {
        started_at + Duration::minutes(i64::from(self.duration_minutes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn paper() -> Vec<ExamQuestion> {
        vec![
            ExamQuestion::new(QuestionId::new(1), 50),
            ExamQuestion::new(QuestionId::new(2), 50),
        ]
    }

    #[test]
    fn published_sums_total_score() {
        let exam = ExamDefinition::published(ExamId::new(1), "Safety", 30, 60, paper()).unwrap();
        assert_eq!(exam.total_score(), 100);
        assert_eq!(exam.retry_limit(), 1);
        assert!(exam.is_open_at(fixed_now()));
    }

    #[test]
    fn pass_score_cannot_exceed_total() {
        let err = ExamDefinition::published(ExamId::new(1), "Safety", 30, 101, paper()).unwrap_err();
        assert_eq!(err, ExamError::PassScoreAboveTotal { pass: 101, total: 100 });
    }

    #[test]
    fn duplicate_questions_are_rejected() {
        let questions = vec![
            ExamQuestion::new(QuestionId::new(1), 10),
            ExamQuestion::new(QuestionId::new(1), 10),
        ];
        let err = ExamDefinition::published(ExamId::new(1), "Dup", 10, 5, questions).unwrap_err();
        assert_eq!(err, ExamError::DuplicateQuestion(QuestionId::new(1)));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let now = fixed_now();
        let exam = ExamDefinition::published(ExamId::new(1), "Window", 30, 60, paper())
            .unwrap()
            .with_window(Some(now), Some(now + Duration::hours(1)))
            .unwrap();

        assert!(exam.is_open_at(now));
        assert!(exam.is_open_at(now + Duration::hours(1)));
        assert!(!exam.is_open_at(now - Duration::seconds(1)));
        assert!(!exam.is_open_at(now + Duration::hours(1) + Duration::seconds(1)));
    }

    #[test]
    fn drafts_are_never_open() {
        let exam = ExamDefinition::published(ExamId::new(1), "Draft", 30, 60, paper())
            .unwrap()
            .with_status(ExamStatus::Draft);
        assert!(!exam.is_open_at(fixed_now()));
    }

    #[test]
    fn deadline_adds_duration() {
        let exam = ExamDefinition::published(ExamId::new(1), "Timed", 45, 60, paper()).unwrap();
        assert_eq!(
            exam.deadline_for(fixed_now()),
            fixed_now() + Duration::minutes(45)
        );
    }
}
