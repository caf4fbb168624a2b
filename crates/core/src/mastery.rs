//! Wrong-question ledger entries and their mastery classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ExamId, QuestionId, UserId, WrongQuestionId};

/// `wrong_count` above this marks a question as repeatedly missed.
pub const INTENSIVE_WRONG_COUNT: u32 = 2;
/// Practice accuracy (percent) below this keeps a repeated miss in intensive practice.
pub const INTENSIVE_ACCURACY_BELOW: u32 = 60;
/// Display-only "nearly mastered" thresholds.
pub const NEARLY_MASTERED_ACCURACY: u32 = 80;
pub const NEARLY_MASTERED_PRACTICES: u32 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MasteryError {
    #[error("unknown mastery status: {0}")]
    UnknownStatus(String),
}

//
// ─── STATUS ────────────────────────────────────────────────────────────────────
//

/// Derived classification of a ledger entry; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryStatus {
    Mastered,
    NeedsIntensivePractice,
    Practicing,
}

impl MasteryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MasteryStatus::Mastered => "mastered",
            MasteryStatus::NeedsIntensivePractice => "needs_intensive_practice",
            MasteryStatus::Practicing => "practicing",
        }
    }

    /// # Errors
    ///
    /// Returns `MasteryError::UnknownStatus` for unrecognised values.
    pub fn parse(value: &str) -> Result<Self, MasteryError> {
        match value {
            "mastered" => Ok(MasteryStatus::Mastered),
            "needs_intensive_practice" => Ok(MasteryStatus::NeedsIntensivePractice),
            "practicing" => Ok(MasteryStatus::Practicing),
            other => Err(MasteryError::UnknownStatus(other.to_owned())),
        }
    }
}

//
// ─── RECORD ────────────────────────────────────────────────────────────────────
//

/// Per-user, per-question aggregate of exam mistakes and practice results.
///
/// `wrong_count` only ever increases. `mastered` is set exclusively by an
/// explicit user action (`mark_mastered`); good practice accuracy alone never
/// flips it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrongQuestionRecord {
    pub id: WrongQuestionId,
    pub user_id: UserId,
    pub question_id: QuestionId,
    /// Exam that first produced the mistake.
    pub origin_exam_id: ExamId,
    pub wrong_count: u32,
    pub correct_count: u32,
    pub practice_count: u32,
    pub mastered: bool,
    pub last_user_answer: Option<String>,
    pub user_note: Option<String>,
    pub last_wrong_at: DateTime<Utc>,
    pub last_practice_at: Option<DateTime<Utc>>,
    pub mastered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WrongQuestionRecord {
    /// Entry created by the first recorded mistake.
    #[must_use]
    pub fn first_mistake(
        id: WrongQuestionId,
        user_id: UserId,
        question_id: QuestionId,
        origin_exam_id: ExamId,
        user_answer: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            question_id,
            origin_exam_id,
            wrong_count: 1,
            correct_count: 0,
            practice_count: 0,
            mastered: false,
            last_user_answer: user_answer,
            user_note: None,
            last_wrong_at: now,
            last_practice_at: None,
            mastered_at: None,
            created_at: now,
        }
    }

    /// Fold another exam mistake into this entry.
    pub fn record_mistake(&mut self, user_answer: Option<String>, now: DateTime<Utc>) {
        self.wrong_count = self.wrong_count.saturating_add(1);
        self.last_wrong_at = now;
        self.last_user_answer = user_answer;
    }

    /// Fold one practice result into this entry.
    pub fn record_practice(&mut self, was_correct: bool, now: DateTime<Utc>) {
        self.practice_count = self.practice_count.saturating_add(1);
        if was_correct {
            self.correct_count = self.correct_count.saturating_add(1);
        }
        self.last_practice_at = Some(now);
    }

    /// Explicit "I've got this" from the user. Repeated calls keep the first timestamp.
    pub fn mark_mastered(&mut self, now: DateTime<Utc>) {
        if !self.mastered {
            self.mastered = true;
            self.mastered_at = Some(now);
        }
    }

    /// Practice accuracy in percent; 0 before any practice.
    #[must_use]
    pub fn accuracy_rate(&self) -> f64 {
        if self.practice_count == 0 {
            return 0.0;
        }
        f64::from(self.correct_count) / f64::from(self.practice_count) * 100.0
    }

    /// `accuracy < percent`, compared in integers so storage queries agree exactly.
    fn accuracy_below(&self, percent: u32) -> bool {
        u64::from(self.correct_count) * 100 < u64::from(self.practice_count) * u64::from(percent)
    }

    #[must_use]
    pub fn needs_intensive_practice(&self) -> bool {
        self.wrong_count > INTENSIVE_WRONG_COUNT
            && (self.practice_count == 0 || self.accuracy_below(INTENSIVE_ACCURACY_BELOW))
    }

    #[must_use]
    pub fn mastery_status(&self) -> MasteryStatus {
        if self.mastered {
            MasteryStatus::Mastered
        } else if self.needs_intensive_practice() {
            MasteryStatus::NeedsIntensivePractice
        } else {
            MasteryStatus::Practicing
        }
    }

    /// Display hint for entries that practice suggests are learned but the
    /// user has not marked as mastered. Does not affect `mastery_status`.
    #[must_use]
    pub fn is_nearly_mastered(&self) -> bool {
        !self.mastered
            && self.practice_count >= NEARLY_MASTERED_PRACTICES
            && !self.accuracy_below(NEARLY_MASTERED_ACCURACY)
    }
}
