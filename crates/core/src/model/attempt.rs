use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::model::exam::ExamDefinition;
use crate::model::ids::{AttemptId, ExamId, QuestionId, UserId};
use crate::model::question::{Question, QuestionType};
use crate::time::whole_minutes_between;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AttemptError {
    #[error("question {0} is part of the exam but missing from the question bank")]
    MissingQuestion(QuestionId),

    #[error("attempt has no questions")]
    EmptySnapshot,

    #[error("unknown attempt state: {0}")]
    UnknownState(String),

    #[error("correct ({correct}) + wrong ({wrong}) does not match total ({total})")]
    CountMismatch { correct: u32, wrong: u32, total: u32 },

    #[error("attempt state {state} is inconsistent with its end time")]
    InconsistentEnd { state: AttemptState },
}

//
// ─── STATE ─────────────────────────────────────────────────────────────────────
//

/// Lifecycle state of an attempt.
///
/// `InProgress` is the only non-terminal state; every terminal state is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    InProgress,
    Pass,
    Fail,
    Timeout,
    Cheating,
}

impl AttemptState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::InProgress => "in_progress",
            AttemptState::Pass => "pass",
            AttemptState::Fail => "fail",
            AttemptState::Timeout => "timeout",
            AttemptState::Cheating => "cheating",
        }
    }

    /// # Errors
    ///
    /// Returns `AttemptError::UnknownState` for unrecognised values.
    pub fn parse(value: &str) -> Result<Self, AttemptError> {
        match value {
            "in_progress" => Ok(AttemptState::InProgress),
            "pass" => Ok(AttemptState::Pass),
            "fail" => Ok(AttemptState::Fail),
            "timeout" => Ok(AttemptState::Timeout),
            "cheating" => Ok(AttemptState::Cheating),
            other => Err(AttemptError::UnknownState(other.to_owned())),
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptState::InProgress)
    }

    /// Transition table: only `InProgress -> terminal` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: AttemptState) -> bool {
        matches!(self, AttemptState::InProgress) && next.is_terminal()
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ─── SNAPSHOT & ANSWERS ────────────────────────────────────────────────────────
//

/// Grading-relevant copy of a question, frozen when the attempt starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSnapshot {
    pub question_id: QuestionId,
    pub question_type: QuestionType,
    pub correct_answer: String,
    pub score: u32,
}

impl QuestionSnapshot {
    /// Freeze `question` with the weight the exam assigns to it.
    #[must_use]
    pub fn capture(question: &Question, score: u32) -> Self {
        Self {
            question_id: question.id(),
            question_type: question.question_type(),
            correct_answer: question.correct_answer().to_owned(),
            score,
        }
    }
}

/// Per-question outcome stored on a graded attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question_id: QuestionId,
    pub user_answer: Option<String>,
    pub is_correct: bool,
    pub awarded_score: u32,
    /// Set for essay answers, which wait for manual marking.
    pub pending_review: bool,
}

//
// ─── NEW ATTEMPT ───────────────────────────────────────────────────────────────
//

/// An attempt that has been validated but not yet stored (no id assigned).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttempt {
    pub user_id: UserId,
    pub exam_id: ExamId,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub pass_score: u32,
    pub total_score: u32,
    pub snapshot: Vec<QuestionSnapshot>,
}

impl NewAttempt {
    /// Freeze the exam paper for a new attempt.
    ///
    /// `questions` may arrive in any order; the snapshot follows the exam's order
    /// and uses the exam's per-question weights.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::MissingQuestion` if a paper question was not supplied,
    /// or `AttemptError::EmptySnapshot` if the paper is empty.
    pub fn begin(
        user_id: UserId,
        exam: &ExamDefinition,
        questions: &[Question],
        started_at: DateTime<Utc>,
    ) -> Result<Self, AttemptError> {
        let by_id: BTreeMap<QuestionId, &Question> =
            questions.iter().map(|q| (q.id(), q)).collect();

        let mut snapshot = Vec::with_capacity(exam.questions().len());
        for slot in exam.questions() {
            let question = by_id
                .get(&slot.question_id)
                .ok_or(AttemptError::MissingQuestion(slot.question_id))?;
            snapshot.push(QuestionSnapshot::capture(question, slot.score));
        }
        if snapshot.is_empty() {
            return Err(AttemptError::EmptySnapshot);
        }

        Ok(Self {
            user_id,
            exam_id: exam.id(),
            started_at,
            deadline: exam.deadline_for(started_at),
            pass_score: exam.pass_score(),
            total_score: exam.total_score(),
            snapshot,
        })
    }

    /// Attach the storage-assigned identity.
    #[must_use]
    pub fn assign(self, id: AttemptId, attempt_number: u32) -> ExamAttempt {
        let total_count = u32::try_from(self.snapshot.len()).unwrap_or(u32::MAX);
        ExamAttempt {
            id,
            user_id: self.user_id,
            exam_id: self.exam_id,
            attempt_number,
            state: AttemptState::InProgress,
            started_at: self.started_at,
            deadline: self.deadline,
            ended_at: None,
            score: 0,
            correct_count: 0,
            wrong_count: 0,
            total_count,
            pass_score: self.pass_score,
            total_score: self.total_score,
            cheat_signal_count: 0,
            flagged_cheating: false,
            snapshot: self.snapshot,
            draft_answers: BTreeMap::new(),
            answers: Vec::new(),
        }
    }
}

//
// ─── ATTEMPT ───────────────────────────────────────────────────────────────────
//

/// Flat persisted form of an attempt, used to rehydrate from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedAttempt {
    pub id: AttemptId,
    pub user_id: UserId,
    pub exam_id: ExamId,
    pub attempt_number: u32,
    pub state: AttemptState,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub score: u32,
    pub correct_count: u32,
    pub wrong_count: u32,
    pub total_count: u32,
    pub pass_score: u32,
    pub total_score: u32,
    pub cheat_signal_count: u32,
    pub flagged_cheating: bool,
    pub snapshot: Vec<QuestionSnapshot>,
    pub draft_answers: BTreeMap<QuestionId, String>,
    pub answers: Vec<AnswerRecord>,
}

/// One user's attempt at one exam.
///
/// Values are immutable from the outside: state changes produce a new
/// `ExamAttempt` via the functions in `grading`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExamAttempt {
    id: AttemptId,
    user_id: UserId,
    exam_id: ExamId,
    attempt_number: u32,
    state: AttemptState,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    score: u32,
    correct_count: u32,
    wrong_count: u32,
    total_count: u32,
    pass_score: u32,
    total_score: u32,
    cheat_signal_count: u32,
    flagged_cheating: bool,
    snapshot: Vec<QuestionSnapshot>,
    draft_answers: BTreeMap<QuestionId, String>,
    answers: Vec<AnswerRecord>,
}

impl ExamAttempt {
    /// Rehydrate an attempt from storage.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::InconsistentEnd` when a terminal attempt has no end
    /// time (or an in-progress one has), and `AttemptError::CountMismatch` when a
    /// terminal attempt's counts do not add up.
    pub fn from_persisted(p: PersistedAttempt) -> Result<Self, AttemptError> {
        if p.state.is_terminal() != p.ended_at.is_some() {
            return Err(AttemptError::InconsistentEnd { state: p.state });
        }
        if p.state.is_terminal()
            && p.correct_count.checked_add(p.wrong_count) != Some(p.total_count)
        {
            return Err(AttemptError::CountMismatch {
                correct: p.correct_count,
                wrong: p.wrong_count,
                total: p.total_count,
            });
        }
        Ok(Self {
            id: p.id,
            user_id: p.user_id,
            exam_id: p.exam_id,
            attempt_number: p.attempt_number,
            state: p.state,
            started_at: p.started_at,
            deadline: p.deadline,
            ended_at: p.ended_at,
            score: p.score,
            correct_count: p.correct_count,
            wrong_count: p.wrong_count,
            total_count: p.total_count,
            pass_score: p.pass_score,
            total_score: p.total_score,
            cheat_signal_count: p.cheat_signal_count,
            flagged_cheating: p.flagged_cheating,
            snapshot: p.snapshot,
            draft_answers: p.draft_answers,
            answers: p.answers,
        })
    }

    /// Copy with new draft answers; used while the attempt is still open.
    pub(crate) fn with_drafts(
        &self,
        draft_answers: BTreeMap<QuestionId, String>,
        cheat_signal_count: u32,
    ) -> Self {
        Self {
            draft_answers,
            cheat_signal_count,
            ..self.clone()
        }
    }

    /// Copy moved into a terminal state with grading results.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn finished(
        &self,
        state: AttemptState,
        ended_at: DateTime<Utc>,
        score: u32,
        correct_count: u32,
        answers: Vec<AnswerRecord>,
        cheat_signal_count: u32,
        flagged_cheating: bool,
    ) -> Self {
        Self {
            state,
            ended_at: Some(ended_at),
            score,
            correct_count,
            wrong_count: self.total_count.saturating_sub(correct_count),
            answers,
            cheat_signal_count,
            flagged_cheating,
            draft_answers: BTreeMap::new(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn id(&self) -> AttemptId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn exam_id(&self) -> ExamId {
        self.exam_id
    }

    #[must_use]
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    #[must_use]
    pub fn state(&self) -> AttemptState {
        self.state
    }

    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.state == AttemptState::InProgress
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    #[must_use]
    pub fn score(&self) -> u32 {
        self.score
    }

    #[must_use]
    pub fn correct_count(&self) -> u32 {
        self.correct_count
    }

    #[must_use]
    pub fn wrong_count(&self) -> u32 {
        self.wrong_count
    }

    #[must_use]
    pub fn total_count(&self) -> u32 {
        self.total_count
    }

    #[must_use]
    pub fn pass_score(&self) -> u32 {
        self.pass_score
    }

    #[must_use]
    pub fn total_score(&self) -> u32 {
        self.total_score
    }

    #[must_use]
    pub fn cheat_signal_count(&self) -> u32 {
        self.cheat_signal_count
    }

    #[must_use]
    pub fn flagged_cheating(&self) -> bool {
        self.flagged_cheating
    }

    #[must_use]
    pub fn snapshot(&self) -> &[QuestionSnapshot] {
        &self.snapshot
    }

    #[must_use]
    pub fn draft_answers(&self) -> &BTreeMap<QuestionId, String> {
        &self.draft_answers
    }

    #[must_use]
    pub fn answers(&self) -> &[AnswerRecord] {
        &self.answers
    }

    /// Whether the wall clock has passed the attempt's deadline.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Percentage of questions answered correctly (0 when nothing was asked).
    #[must_use]
    pub fn accuracy_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        f64::from(self.correct_count) / f64::from(self.total_count) * 100.0
    }

    /// Whole minutes between start and end, if the attempt has ended.
    #[must_use]
    pub fn duration_minutes(&self) -> Option<u32> {
        self.ended_at
            .map(|end| whole_minutes_between(self.started_at, end))
    }
}

//
// ─── RESULT VIEW ───────────────────────────────────────────────────────────────
//

/// Outcome of a graded attempt as handed to presentation/reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExamResult {
    pub attempt_id: AttemptId,
    pub user_id: UserId,
    pub exam_id: ExamId,
    pub attempt_number: u32,
    pub state: AttemptState,
    pub passed: bool,
    pub score: u32,
    pub total_score: u32,
    pub pass_score: u32,
    pub correct_count: u32,
    pub wrong_count: u32,
    pub total_count: u32,
    pub accuracy_rate: f64,
    pub flagged_cheating: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub answers: Vec<AnswerRecord>,
}

impl ExamResult {
    /// Build the result view; `None` while the attempt is still in progress.
    #[must_use]
    pub fn from_attempt(attempt: &ExamAttempt) -> Option<Self> {
        attempt
            .ended_at()
            .map(|ended_at| Self::ended(attempt, ended_at))
    }

    pub(crate) fn ended(attempt: &ExamAttempt, ended_at: DateTime<Utc>) -> Self {
        Self {
            attempt_id: attempt.id(),
            user_id: attempt.user_id(),
            exam_id: attempt.exam_id(),
            attempt_number: attempt.attempt_number(),
            state: attempt.state(),
            passed: attempt.state() == AttemptState::Pass,
            score: attempt.score(),
            total_score: attempt.total_score(),
            pass_score: attempt.pass_score(),
            correct_count: attempt.correct_count(),
            wrong_count: attempt.wrong_count(),
            total_count: attempt.total_count(),
            accuracy_rate: attempt.accuracy_rate(),
            flagged_cheating: attempt.flagged_cheating(),
            started_at: attempt.started_at(),
            ended_at,
            duration_minutes: whole_minutes_between(attempt.started_at(), ended_at),
            answers: attempt.answers().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::exam::ExamQuestion;
    use crate::time::fixed_now;

    fn exam() -> ExamDefinition {
        ExamDefinition::published(
            ExamId::new(7),
            "Forklift basics",
            30,
            60,
            vec![
                ExamQuestion::new(QuestionId::new(2), 40),
                ExamQuestion::new(QuestionId::new(1), 60),
            ],
        )
        .unwrap()
    }

    fn bank() -> Vec<Question> {
        vec![
            Question::new(QuestionId::new(1), QuestionType::SingleChoice, "Q1", "B").unwrap(),
            Question::new(QuestionId::new(2), QuestionType::TrueFalse, "Q2", "true")
                .unwrap()
                .with_score(5),
        ]
    }

    #[test]
    fn snapshot_follows_exam_order_and_weights() {
        let new = NewAttempt::begin(UserId::new(1), &exam(), &bank(), fixed_now()).unwrap();
        let ids: Vec<_> = new.snapshot.iter().map(|s| s.question_id).collect();
        assert_eq!(ids, vec![QuestionId::new(2), QuestionId::new(1)]);
        assert_eq!(new.snapshot[0].score, 40);
        assert_eq!(new.deadline, fixed_now() + chrono::Duration::minutes(30));
    }

    #[test]
    fn missing_bank_question_is_reported() {
        let err = NewAttempt::begin(UserId::new(1), &exam(), &bank()[..1], fixed_now())
            .unwrap_err();
        assert_eq!(err, AttemptError::MissingQuestion(QuestionId::new(2)));
    }

    #[test]
    fn assigned_attempt_starts_in_progress() {
        let attempt = NewAttempt::begin(UserId::new(1), &exam(), &bank(), fixed_now())
            .unwrap()
            .assign(AttemptId::new(3), 1);
        assert!(attempt.is_in_progress());
        assert_eq!(attempt.total_count(), 2);
        assert_eq!(attempt.ended_at(), None);
        assert!(ExamResult::from_attempt(&attempt).is_none());
    }

    #[test]
    fn transition_table_only_leaves_in_progress() {
        use AttemptState::*;
        for next in [Pass, Fail, Timeout, Cheating] {
            assert!(InProgress.can_transition_to(next));
            for from in [Pass, Fail, Timeout, Cheating] {
                assert!(!from.can_transition_to(next));
                assert!(!from.can_transition_to(InProgress));
            }
        }
        assert!(!InProgress.can_transition_to(InProgress));
    }

    fn persisted_pass() -> PersistedAttempt {
        let attempt = NewAttempt::begin(UserId::new(1), &exam(), &bank(), fixed_now())
            .unwrap()
            .assign(AttemptId::new(3), 1);
        PersistedAttempt {
            id: attempt.id(),
            user_id: attempt.user_id(),
            exam_id: attempt.exam_id(),
            attempt_number: 1,
            state: AttemptState::Pass,
            started_at: attempt.started_at(),
            deadline: attempt.deadline(),
            ended_at: None,
            score: 100,
            correct_count: 2,
            wrong_count: 0,
            total_count: 2,
            pass_score: 60,
            total_score: 100,
            cheat_signal_count: 0,
            flagged_cheating: false,
            snapshot: attempt.snapshot().to_vec(),
            draft_answers: BTreeMap::new(),
            answers: Vec::new(),
        }
    }

    #[test]
    fn persisted_terminal_attempt_needs_end_time() {
        let err = ExamAttempt::from_persisted(persisted_pass()).unwrap_err();
        assert_eq!(
            err,
            AttemptError::InconsistentEnd {
                state: AttemptState::Pass
            }
        );
    }

    #[test]
    fn persisted_counts_that_overflow_are_a_mismatch() {
        let persisted = PersistedAttempt {
            ended_at: Some(fixed_now()),
            correct_count: u32::MAX,
            wrong_count: 1,
            ..persisted_pass()
        };
        assert_eq!(
            ExamAttempt::from_persisted(persisted).unwrap_err(),
            AttemptError::CountMismatch {
                correct: u32::MAX,
                wrong: 1,
                total: 2,
            }
        );

        let consistent = PersistedAttempt {
            ended_at: Some(fixed_now()),
            ..persisted_pass()
        };
        assert!(ExamAttempt::from_persisted(consistent).is_ok());
    }
}
