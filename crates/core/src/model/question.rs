use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::QuestionId;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QuestionError {
    #[error("question content cannot be empty")]
    EmptyContent,

    #[error("question {0} needs a correct answer to be auto-graded")]
    MissingAnswer(QuestionId),

    #[error("difficulty must be between 1 and 5, got {0}")]
    InvalidDifficulty(u8),

    #[error("unknown question type: {0}")]
    UnknownType(String),

    #[error("unknown question status: {0}")]
    UnknownStatus(String),
}

//
// ─── QUESTION TYPE ─────────────────────────────────────────────────────────────
//

/// Question formats supported by the grader.
///
/// The scoring rule for each type is fixed; see `grading::is_correct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
    TrueFalse,
    FillBlank,
    /// Free-text answer. Never auto-correct; manual marking happens elsewhere.
    Essay,
}

impl QuestionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::SingleChoice => "single_choice",
            QuestionType::MultipleChoice => "multiple_choice",
            QuestionType::TrueFalse => "true_false",
            QuestionType::FillBlank => "fill_blank",
            QuestionType::Essay => "essay",
        }
    }

    /// Parses the storage representation produced by `as_str`.
    ///
    /// # Errors
    ///
    /// Returns `QuestionError::UnknownType` for any other string.
    pub fn parse(value: &str) -> Result<Self, QuestionError> {
        match value {
            "single_choice" => Ok(QuestionType::SingleChoice),
            "multiple_choice" => Ok(QuestionType::MultipleChoice),
            "true_false" => Ok(QuestionType::TrueFalse),
            "fill_blank" => Ok(QuestionType::FillBlank),
            "essay" => Ok(QuestionType::Essay),
            other => Err(QuestionError::UnknownType(other.to_owned())),
        }
    }

    #[must_use]
    pub fn is_auto_graded(self) -> bool {
        !matches!(self, QuestionType::Essay)
    }
}

/// Availability of a question in the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    #[default]
    Active,
    Inactive,
    Deleted,
}

impl QuestionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionStatus::Active => "active",
            QuestionStatus::Inactive => "inactive",
            QuestionStatus::Deleted => "deleted",
        }
    }

    /// # Errors
    ///
    /// Returns `QuestionError::UnknownStatus` for unrecognised values.
    pub fn parse(value: &str) -> Result<Self, QuestionError> {
        match value {
            "active" => Ok(QuestionStatus::Active),
            "inactive" => Ok(QuestionStatus::Inactive),
            "deleted" => Ok(QuestionStatus::Deleted),
            other => Err(QuestionError::UnknownStatus(other.to_owned())),
        }
    }
}

//
// ─── QUESTION ──────────────────────────────────────────────────────────────────
//

/// A question as held by the question bank.
///
/// `correct_answer` is type-dependent text: an option key for single choice,
/// a set of option keys for multiple choice ("A,C" or "AC"), a boolean
/// spelling for true/false, and the expected text for fill-blank (blanks
/// separated by `|`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    id: QuestionId,
    content: String,
    question_type: QuestionType,
    options: Vec<String>,
    correct_answer: String,
    explanation: Option<String>,
    score: u32,
    difficulty: u8,
    category: Option<String>,
    status: QuestionStatus,
}

impl Question {
    /// Default weight when an exam does not override it.
    pub const DEFAULT_SCORE: u32 = 1;

    /// Create an active question with default weight and difficulty.
    ///
    /// # Errors
    ///
    /// Returns `QuestionError::EmptyContent` for blank content, or
    /// `QuestionError::MissingAnswer` when an auto-graded type has no answer.
    pub fn new(
        id: QuestionId,
        question_type: QuestionType,
        content: impl Into<String>,
        correct_answer: impl Into<String>,
    ) -> Result<Self, QuestionError> {
        let content = content.into();
        let correct_answer = correct_answer.into();
        if content.trim().is_empty() {
            return Err(QuestionError::EmptyContent);
        }
        if question_type.is_auto_graded() && correct_answer.trim().is_empty() {
            return Err(QuestionError::MissingAnswer(id));
        }
        Ok(Self {
            id,
            content,
            question_type,
            options: Vec::new(),
            correct_answer,
            explanation: None,
            score: Self::DEFAULT_SCORE,
            difficulty: 1,
            category: None,
            status: QuestionStatus::Active,
        })
    }

    #[must_use]
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    #[must_use]
    pub fn with_score(mut self, score: u32) -> Self {
        self.score = score;
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: QuestionStatus) -> Self {
        self.status = status;
        self
    }

    /// # Errors
    ///
    /// Returns `QuestionError::InvalidDifficulty` outside `1..=5`.
    pub fn with_difficulty(mut self, difficulty: u8) -> Result<Self, QuestionError> {
        if !(1..=5).contains(&difficulty) {
            return Err(QuestionError::InvalidDifficulty(difficulty));
        }
        self.difficulty = difficulty;
        Ok(self)
    }

    #[must_use]
    pub fn id(&self) -> QuestionId {
        self.id
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn question_type(&self) -> QuestionType {
        self.question_type
    }

    #[must_use]
    pub fn options(&self) -> &[String] {
        &self.options
    }

    #[must_use]
    pub fn correct_answer(&self) -> &str {
        &self.correct_answer
    }

    #[must_use]
    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_deref()
    }

    #[must_use]
    pub fn score(&self) -> u32 {
        self.score
    }

    #[must_use]
    pub fn difficulty(&self) -> u8 {
        self.difficulty
    }

    #[must_use]
    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    #[must_use]
    pub fn status(&self) -> QuestionStatus {
        self.status
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == QuestionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_content_is_rejected() {
        let err = Question::new(QuestionId::new(1), QuestionType::SingleChoice, "  ", "A")
            .unwrap_err();
        assert_eq!(err, QuestionError::EmptyContent);
    }

    #[test]
    fn essay_does_not_need_an_answer() {
        let q = Question::new(QuestionId::new(2), QuestionType::Essay, "Explain", "").unwrap();
        assert!(!q.question_type().is_auto_graded());
    }

    #[test]
    fn choice_without_answer_is_rejected() {
        let err = Question::new(QuestionId::new(3), QuestionType::MultipleChoice, "Pick", " ")
            .unwrap_err();
        assert_eq!(err, QuestionError::MissingAnswer(QuestionId::new(3)));
    }

    #[test]
    fn difficulty_is_bounded() {
        let q = Question::new(QuestionId::new(4), QuestionType::TrueFalse, "Sky is blue", "true")
            .unwrap();
        assert!(q.clone().with_difficulty(5).is_ok());
        assert_eq!(
            q.with_difficulty(0).unwrap_err(),
            QuestionError::InvalidDifficulty(0)
        );
    }

    #[test]
    fn type_strings_round_trip() {
        for ty in [
            QuestionType::SingleChoice,
            QuestionType::MultipleChoice,
            QuestionType::TrueFalse,
            QuestionType::FillBlank,
            QuestionType::Essay,
        ] {
            assert_eq!(QuestionType::parse(ty.as_str()).unwrap(), ty);
        }
        assert!(QuestionType::parse("matching").is_err());
    }
}
