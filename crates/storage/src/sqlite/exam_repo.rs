use exam_core::model::{ExamDefinition, ExamId};

use super::{
    SqliteRepository, conn,
    mapping::{id_i64, map_exam_question_row, map_exam_row},
};
use crate::repository::{ExamCatalog, StorageError};

#[async_trait::async_trait]
impl ExamCatalog for SqliteRepository {
    async fn upsert_exam(&self, exam: &ExamDefinition) -> Result<(), StorageError> {
        let exam_id = id_i64("exam_id", exam.id().value())?;
        let mut tx = self.pool.begin().await.map_err(conn)?;

        sqlx::query(
            r"
                INSERT INTO exams (
                    id, title, duration_minutes, total_score, pass_score,
                    start_window, end_window, retry_limit, status
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    duration_minutes = excluded.duration_minutes,
                    total_score = excluded.total_score,
                    pass_score = excluded.pass_score,
                    start_window = excluded.start_window,
                    end_window = excluded.end_window,
                    retry_limit = excluded.retry_limit,
                    status = excluded.status
            ",
        )
        .bind(exam_id)
        .bind(exam.title())
        .bind(i64::from(exam.duration_minutes()))
        .bind(i64::from(exam.total_score()))
        .bind(i64::from(exam.pass_score()))
        .bind(exam.start_window())
        .bind(exam.end_window())
        .bind(i64::from(exam.retry_limit()))
        .bind(exam.status().as_str())
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        // The paper is replaced wholesale; running attempts grade from their snapshot.
        sqlx::query("DELETE FROM exam_questions WHERE exam_id = ?1")
            .bind(exam_id)
            .execute(&mut *tx)
            .await
            .map_err(conn)?;

        for (position, slot) in exam.questions().iter().enumerate() {
            sqlx::query(
                r"
                    INSERT INTO exam_questions (exam_id, position, question_id, score)
                    VALUES (?1, ?2, ?3, ?4)
                ",
            )
            .bind(exam_id)
            .bind(
                i64::try_from(position)
                    .map_err(|_| StorageError::Serialization("position overflow".into()))?,
            )
            .bind(id_i64("question_id", slot.question_id.value())?)
            .bind(i64::from(slot.score))
            .execute(&mut *tx)
            .await
            .map_err(conn)?;
        }

        tx.commit().await.map_err(conn)?;
        Ok(())
    }

    async fn get_exam(&self, id: ExamId) -> Result<ExamDefinition, StorageError> {
        let exam_id = id_i64("exam_id", id.value())?;
        let mut tx = self.pool.begin().await.map_err(conn)?;

        let row = sqlx::query(
            r"
                SELECT
                    id, title, duration_minutes, total_score, pass_score,
                    start_window, end_window, retry_limit, status
                FROM exams
                WHERE id = ?1
            ",
        )
        .bind(exam_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;

        let slots = sqlx::query(
            r"
                SELECT question_id, score
                FROM exam_questions
                WHERE exam_id = ?1
                ORDER BY position ASC
            ",
        )
        .bind(exam_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(conn)?;
        tx.commit().await.map_err(conn)?;

        let questions = slots
            .iter()
            .map(map_exam_question_row)
            .collect::<Result<Vec<_>, _>>()?;
        map_exam_row(&row, questions)
    }
}
