//! Deterministic grading of attempts against their frozen snapshot.
//!
//! Every function here is pure: it takes the current attempt and returns a new
//! one (plus the mistakes it produced) without touching storage.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::model::{
    AnswerRecord, AttemptState, ExamAttempt, ExamResult, QuestionId, QuestionSnapshot,
    QuestionType,
};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GradingError {
    #[error("attempt is not in progress (state: {0})")]
    NotInProgress(AttemptState),

    #[error("answer references question {0}, which is not part of this attempt")]
    UnknownQuestion(QuestionId),

    /// `deadline` is the moment the attempt closes, grace period included.
    #[error("attempt stays open until {deadline}")]
    DeadlineNotReached { deadline: DateTime<Utc> },
}

//
// ─── POLICY ────────────────────────────────────────────────────────────────────
//

/// Grading knobs that are configured per deployment, not per exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingPolicy {
    cheat_signal_threshold: u32,
    late_submission_grace_secs: u32,
}

impl Default for GradingPolicy {
    fn default() -> Self {
        Self {
            cheat_signal_threshold: Self::DEFAULT_CHEAT_SIGNAL_THRESHOLD,
            late_submission_grace_secs: 0,
        }
    }
}

impl GradingPolicy {
    pub const DEFAULT_CHEAT_SIGNAL_THRESHOLD: u32 = 3;

    #[must_use]
    pub fn new(cheat_signal_threshold: u32, late_submission_grace_secs: u32) -> Self {
        Self {
            cheat_signal_threshold,
            late_submission_grace_secs,
        }
    }

    /// Counts strictly above this value flag the attempt as cheating.
    #[must_use]
    pub fn cheat_signal_threshold(&self) -> u32 {
        self.cheat_signal_threshold
    }

    #[must_use]
    pub fn late_submission_grace(&self) -> Duration {
        Duration::seconds(i64::from(self.late_submission_grace_secs))
    }

    /// The last moment a submission for an attempt due at `deadline` is still on time.
    #[must_use]
    pub fn closes_at(&self, deadline: DateTime<Utc>) -> DateTime<Utc> {
        deadline + self.late_submission_grace()
    }

    #[must_use]
    pub fn is_cheating(&self, cheat_signal_count: u32) -> bool {
        cheat_signal_count > self.cheat_signal_threshold
    }
}

//
// ─── INPUTS / OUTPUTS ──────────────────────────────────────────────────────────
//

/// Answers sent by the client, keyed by question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub answers: BTreeMap<QuestionId, String>,
    /// Client-reported suspicious events (tab switches) so far.
    pub cheat_signal_count: u32,
}

impl Submission {
    #[must_use]
    pub fn new(answers: BTreeMap<QuestionId, String>, cheat_signal_count: u32) -> Self {
        Self {
            answers,
            cheat_signal_count,
        }
    }

    #[must_use]
    pub fn answer(mut self, question_id: QuestionId, answer: impl Into<String>) -> Self {
        self.answers.insert(question_id, answer.into());
        self
    }

    #[must_use]
    pub fn with_cheat_signals(mut self, count: u32) -> Self {
        self.cheat_signal_count = count;
        self
    }
}

/// An incorrect (or missing) answer, to be folded into the wrong-question ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mistake {
    pub question_id: QuestionId,
    pub user_answer: Option<String>,
}

/// A completed `InProgress -> terminal` transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub attempt: ExamAttempt,
    pub mistakes: Vec<Mistake>,
    pub result: ExamResult,
}

//
// ─── TRANSITIONS ───────────────────────────────────────────────────────────────
//

/// Grade a client submission.
///
/// Submitted answers are laid over any saved drafts. A submission that arrives
/// after the deadline plus the policy's grace period is graded like an expiry.
///
/// # Errors
///
/// Returns `GradingError::NotInProgress` for terminal attempts and
/// `GradingError::UnknownQuestion` for answers outside the snapshot.
pub fn submit(
    attempt: &ExamAttempt,
    submission: &Submission,
    policy: &GradingPolicy,
    now: DateTime<Utc>,
) -> Result<Transition, GradingError> {
    ensure_in_progress(attempt)?;
    ensure_known_questions(attempt, &submission.answers)?;

    let mut answers = attempt.draft_answers().clone();
    answers.extend(
        submission
            .answers
            .iter()
            .map(|(id, answer)| (*id, answer.clone())),
    );
    let cheat_signals = attempt
        .cheat_signal_count()
        .max(submission.cheat_signal_count);

    let late = now > policy.closes_at(attempt.deadline());
    let forced = late.then_some(AttemptState::Timeout);
    Ok(finish(attempt, &answers, cheat_signals, forced, policy, now))
}

/// Close an overdue attempt, grading whatever drafts were captured.
///
/// # Errors
///
/// Returns `GradingError::NotInProgress` for terminal attempts and
/// `GradingError::DeadlineNotReached` until the deadline plus the policy's
/// grace period has passed.
pub fn expire(
    attempt: &ExamAttempt,
    policy: &GradingPolicy,
    now: DateTime<Utc>,
) -> Result<Transition, GradingError> {
    ensure_in_progress(attempt)?;
    let closes_at = policy.closes_at(attempt.deadline());
    if now <= closes_at {
        return Err(GradingError::DeadlineNotReached {
            deadline: closes_at,
        });
    }
    Ok(finish(
        attempt,
        attempt.draft_answers(),
        attempt.cheat_signal_count(),
        Some(AttemptState::Timeout),
        policy,
        now,
    ))
}

/// Capture answers for an attempt that is still open.
///
/// Drafts replace earlier drafts per question; the cheat counter never goes down.
///
/// # Errors
///
/// Same validation as `submit`.
pub fn save_draft(
    attempt: &ExamAttempt,
    submission: &Submission,
) -> Result<ExamAttempt, GradingError> {
    validate_draft(attempt, submission)?;

    let mut drafts = attempt.draft_answers().clone();
    drafts.extend(
        submission
            .answers
            .iter()
            .map(|(id, answer)| (*id, answer.clone())),
    );
    let cheat_signals = attempt
        .cheat_signal_count()
        .max(submission.cheat_signal_count);
    Ok(attempt.with_drafts(drafts, cheat_signals))
}

/// Check a draft against the attempt without building the merged copy.
///
/// # Errors
///
/// Same validation as `submit`.
pub fn validate_draft(attempt: &ExamAttempt, submission: &Submission) -> Result<(), GradingError> {
    ensure_in_progress(attempt)?;
    ensure_known_questions(attempt, &submission.answers)
}

fn ensure_in_progress(attempt: &ExamAttempt) -> Result<(), GradingError> {
    if attempt.is_in_progress() {
        Ok(())
    } else {
        Err(GradingError::NotInProgress(attempt.state()))
    }
}

fn ensure_known_questions(
    attempt: &ExamAttempt,
    answers: &BTreeMap<QuestionId, String>,
) -> Result<(), GradingError> {
    let known: BTreeSet<QuestionId> = attempt.snapshot().iter().map(|s| s.question_id).collect();
    match answers.keys().find(|id| !known.contains(id)) {
        Some(id) => Err(GradingError::UnknownQuestion(*id)),
        None => Ok(()),
    }
}

fn finish(
    attempt: &ExamAttempt,
    answers: &BTreeMap<QuestionId, String>,
    cheat_signals: u32,
    forced: Option<AttemptState>,
    policy: &GradingPolicy,
    now: DateTime<Utc>,
) -> Transition {
    let mut records = Vec::with_capacity(attempt.snapshot().len());
    let mut mistakes = Vec::new();
    let mut score = 0_u32;
    let mut correct = 0_u32;

    for question in attempt.snapshot() {
        let user_answer = answers.get(&question.question_id).cloned();
        let record = grade_question(question, user_answer);
        if record.is_correct {
            correct = correct.saturating_add(1);
            score = score.saturating_add(record.awarded_score);
        } else if question.question_type.is_auto_graded() {
            mistakes.push(Mistake {
                question_id: record.question_id,
                user_answer: record.user_answer.clone(),
            });
        }
        records.push(record);
    }

    let flagged = policy.is_cheating(cheat_signals);
    let state = forced.unwrap_or(if flagged {
        AttemptState::Cheating
    } else if score >= attempt.pass_score() {
        AttemptState::Pass
    } else {
        AttemptState::Fail
    });
    debug_assert!(attempt.state().can_transition_to(state));

    let attempt = attempt.finished(state, now, score, correct, records, cheat_signals, flagged);
    Transition {
        result: ExamResult::ended(&attempt, now),
        attempt,
        mistakes,
    }
}

fn grade_question(question: &QuestionSnapshot, user_answer: Option<String>) -> AnswerRecord {
    let is_correct = user_answer.as_deref().is_some_and(|answer| {
        is_correct(question.question_type, &question.correct_answer, answer)
    });
    AnswerRecord {
        question_id: question.question_id,
        awarded_score: if is_correct { question.score } else { 0 },
        pending_review: question.question_type == QuestionType::Essay
            && user_answer.as_deref().is_some_and(|a| !a.trim().is_empty()),
        user_answer,
        is_correct,
    }
}

//
// ─── ANSWER MATCHING ───────────────────────────────────────────────────────────
//

/// Fixed per-type matching rule between a stored correct answer and a user answer.
#[must_use]
pub fn is_correct(question_type: QuestionType, correct: &str, answer: &str) -> bool {
    match question_type {
        QuestionType::SingleChoice => choice_key(correct) == choice_key(answer),
        QuestionType::TrueFalse => match (parse_bool(correct), parse_bool(answer)) {
            (Some(expected), Some(given)) => expected == given,
            _ => choice_key(correct) == choice_key(answer),
        },
        QuestionType::MultipleChoice => {
            let expected = option_set(correct);
            !expected.is_empty() && expected == option_set(answer)
        }
        QuestionType::FillBlank => blanks(correct) == blanks(answer),
        QuestionType::Essay => false,
    }
}

fn choice_key(value: &str) -> String {
    value.trim().to_uppercase()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// "A,C", "c a", "A;C" and "AC" all become {A, C}.
fn option_set(value: &str) -> BTreeSet<String> {
    let tokens: Vec<&str> = value
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();

    if let [packed] = tokens.as_slice() {
        if packed.len() > 1 && packed.chars().all(|c| c.is_ascii_alphabetic()) {
            return packed.chars().map(|c| c.to_ascii_uppercase().to_string()).collect();
        }
    }
    tokens.into_iter().map(str::to_uppercase).collect()
}

fn blanks(value: &str) -> Vec<String> {
    value.split('|').map(|b| b.trim().to_lowercase()).collect()
}
