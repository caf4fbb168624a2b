use exam_core::model::{Question, QuestionId};
use sqlx::{QueryBuilder, Sqlite};

use super::{
    SqliteRepository, conn,
    mapping::{id_i64, map_question_row, to_json},
};
use crate::repository::{QuestionBank, StorageError};

const QUESTION_COLUMNS: &str = "id, content, question_type, options, correct_answer, \
     explanation, score, difficulty, category, status";

#[async_trait::async_trait]
impl QuestionBank for SqliteRepository {
    async fn upsert_question(&self, question: &Question) -> Result<(), StorageError> {
        sqlx::query(
            r"
                INSERT INTO questions (
                    id, content, question_type, options, correct_answer,
                    explanation, score, difficulty, category, status
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    question_type = excluded.question_type,
                    options = excluded.options,
                    correct_answer = excluded.correct_answer,
                    explanation = excluded.explanation,
                    score = excluded.score,
                    difficulty = excluded.difficulty,
                    category = excluded.category,
                    status = excluded.status
            ",
        )
        .bind(id_i64("question_id", question.id().value())?)
        .bind(question.content())
        .bind(question.question_type().as_str())
        .bind(to_json(&question.options())?)
        .bind(question.correct_answer())
        .bind(question.explanation())
        .bind(i64::from(question.score()))
        .bind(i64::from(question.difficulty()))
        .bind(question.category())
        .bind(question.status().as_str())
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        Ok(())
    }

    async fn get_question(&self, id: QuestionId) -> Result<Question, StorageError> {
        let sql = format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id_i64("question_id", id.value())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        map_question_row(&row)
    }

    async fn get_questions(&self, ids: &[QuestionId]) -> Result<Vec<Question>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {QUESTION_COLUMNS} FROM questions WHERE id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id_i64("question_id", id.value())?);
        }
        separated.push_unseparated(")");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        rows.iter().map(map_question_row).collect()
    }
}
