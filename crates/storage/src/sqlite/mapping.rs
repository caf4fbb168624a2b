use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use exam_core::mastery::WrongQuestionRecord;
use exam_core::model::{
    AnswerRecord, AttemptId, AttemptState, ExamAttempt, ExamDefinition, ExamId, ExamQuestion,
    ExamStatus, PersistedAttempt, Question, QuestionId, QuestionSnapshot, QuestionStatus,
    QuestionType, UserId, WrongQuestionId,
};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

fn i64_to_u32(field: &'static str, v: i64) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Serialization(format!("invalid {field}: {v}")))
}

pub(crate) fn id_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(ser)
}

fn from_json<T: DeserializeOwned>(
    row: &SqliteRow,
    column: &'static str,
) -> Result<T, StorageError> {
    let raw: String = row.try_get(column).map_err(ser)?;
    serde_json::from_str(&raw).map_err(|e| StorageError::Serialization(format!("{column}: {e}")))
}

fn get_u32(row: &SqliteRow, column: &'static str) -> Result<u32, StorageError> {
    i64_to_u32(column, row.try_get::<i64, _>(column).map_err(ser)?)
}

fn get_u64(row: &SqliteRow, column: &'static str) -> Result<u64, StorageError> {
    i64_to_u64(column, row.try_get::<i64, _>(column).map_err(ser)?)
}

pub(crate) fn map_question_row(row: &SqliteRow) -> Result<Question, StorageError> {
    let question_type: String = row.try_get("question_type").map_err(ser)?;
    let status: String = row.try_get("status").map_err(ser)?;
    let difficulty = u8::try_from(row.try_get::<i64, _>("difficulty").map_err(ser)?)
        .map_err(|_| StorageError::Serialization("difficulty out of range".into()))?;

    let mut question = Question::new(
        QuestionId::new(get_u64(row, "id")?),
        QuestionType::parse(&question_type).map_err(ser)?,
        row.try_get::<String, _>("content").map_err(ser)?,
        row.try_get::<String, _>("correct_answer").map_err(ser)?,
    )
    .map_err(ser)?
    .with_options(from_json(row, "options")?)
    .with_score(get_u32(row, "score")?)
    .with_status(QuestionStatus::parse(&status).map_err(ser)?)
    .with_difficulty(difficulty)
    .map_err(ser)?;

    if let Some(explanation) = row.try_get::<Option<String>, _>("explanation").map_err(ser)? {
        question = question.with_explanation(explanation);
    }
    if let Some(category) = row.try_get::<Option<String>, _>("category").map_err(ser)? {
        question = question.with_category(category);
    }
    Ok(question)
}

pub(crate) fn map_exam_question_row(row: &SqliteRow) -> Result<ExamQuestion, StorageError> {
    Ok(ExamQuestion::new(
        QuestionId::new(get_u64(row, "question_id")?),
        get_u32(row, "score")?,
    ))
}

pub(crate) fn map_exam_row(
    row: &SqliteRow,
    questions: Vec<ExamQuestion>,
) -> Result<ExamDefinition, StorageError> {
    let status: String = row.try_get("status").map_err(ser)?;
    ExamDefinition::new(
        ExamId::new(get_u64(row, "id")?),
        row.try_get::<String, _>("title").map_err(ser)?,
        get_u32(row, "duration_minutes")?,
        get_u32(row, "total_score")?,
        get_u32(row, "pass_score")?,
        row.try_get("start_window").map_err(ser)?,
        row.try_get("end_window").map_err(ser)?,
        get_u32(row, "retry_limit")?,
        ExamStatus::parse(&status).map_err(ser)?,
        questions,
    )
    .map_err(ser)
}

pub(crate) fn map_attempt_row(row: &SqliteRow) -> Result<ExamAttempt, StorageError> {
    let state: String = row.try_get("state").map_err(ser)?;
    let snapshot: Vec<QuestionSnapshot> = from_json(row, "snapshot")?;
    let draft_answers: BTreeMap<QuestionId, String> = from_json(row, "draft_answers")?;
    let answers: Vec<AnswerRecord> = from_json(row, "answers")?;

    ExamAttempt::from_persisted(PersistedAttempt {
        id: AttemptId::new(get_u64(row, "id")?),
        user_id: UserId::new(get_u64(row, "user_id")?),
        exam_id: ExamId::new(get_u64(row, "exam_id")?),
        attempt_number: get_u32(row, "attempt_number")?,
        state: AttemptState::parse(&state).map_err(ser)?,
        started_at: row.try_get("started_at").map_err(ser)?,
        deadline: row.try_get("deadline").map_err(ser)?,
        ended_at: row.try_get("ended_at").map_err(ser)?,
        score: get_u32(row, "score")?,
        correct_count: get_u32(row, "correct_count")?,
        wrong_count: get_u32(row, "wrong_count")?,
        total_count: get_u32(row, "total_count")?,
        pass_score: get_u32(row, "pass_score")?,
        total_score: get_u32(row, "total_score")?,
        cheat_signal_count: get_u32(row, "cheat_signal_count")?,
        flagged_cheating: row.try_get("flagged_cheating").map_err(ser)?,
        snapshot,
        draft_answers,
        answers,
    })
    .map_err(ser)
}

pub(crate) fn map_wrong_question_row(
    row: &SqliteRow,
) -> Result<WrongQuestionRecord, StorageError> {
    let last_wrong_at: DateTime<Utc> = row.try_get("last_wrong_at").map_err(ser)?;
    Ok(WrongQuestionRecord {
        id: WrongQuestionId::new(get_u64(row, "id")?),
        user_id: UserId::new(get_u64(row, "user_id")?),
        question_id: QuestionId::new(get_u64(row, "question_id")?),
        origin_exam_id: ExamId::new(get_u64(row, "origin_exam_id")?),
        wrong_count: get_u32(row, "wrong_count")?,
        correct_count: get_u32(row, "correct_count")?,
        practice_count: get_u32(row, "practice_count")?,
        mastered: row.try_get("mastered").map_err(ser)?,
        last_user_answer: row.try_get("last_user_answer").map_err(ser)?,
        user_note: row.try_get("user_note").map_err(ser)?,
        last_wrong_at,
        last_practice_at: row.try_get("last_practice_at").map_err(ser)?,
        mastered_at: row.try_get("mastered_at").map_err(ser)?,
        created_at: row.try_get("created_at").map_err(ser)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_answers_survive_json_with_numeric_keys() {
        let mut drafts = BTreeMap::new();
        drafts.insert(QuestionId::new(12), "A,C".to_owned());
        let raw = to_json(&drafts).unwrap();
        assert_eq!(raw, r#"{"12":"A,C"}"#);
        let back: BTreeMap<QuestionId, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, drafts);
    }

    #[test]
    fn negative_ids_are_rejected() {
        assert!(matches!(
            i64_to_u64("id", -1),
            Err(StorageError::Serialization(_))
        ));
        assert!(id_i64("id", u64::MAX).is_err());
    }
}
