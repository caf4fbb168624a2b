use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use exam_core::grading::Mistake;
use exam_core::mastery::WrongQuestionRecord;
use exam_core::model::{ExamId, QuestionId, UserId};
use sqlx::{Row, SqliteConnection};

use super::{
    SqliteRepository, conn,
    mapping::{id_i64, map_wrong_question_row, ser},
};
use crate::repository::{
    StorageError, UNCATEGORIZED, WrongQuestionFilter, WrongQuestionRepository, WrongQuestionStats,
};

const LEDGER_COLUMNS: &str = "w.id, w.user_id, w.question_id, w.origin_exam_id, w.wrong_count, \
     w.correct_count, w.practice_count, w.mastered, w.last_user_answer, w.user_note, \
     w.last_wrong_at, w.last_practice_at, w.mastered_at, w.created_at";

/// SQL form of `WrongQuestionRecord::needs_intensive_practice`, over alias `w`.
const INTENSIVE_SQL: &str = "(w.mastered = 0 AND w.wrong_count > 2 \
     AND (w.practice_count = 0 OR w.correct_count * 100 < w.practice_count * 60))";

/// Create the ledger entry or bump its counter in place.
pub(super) async fn upsert_mistake(
    db: &mut SqliteConnection,
    user_id: i64,
    exam_id: i64,
    mistake: &Mistake,
    now: DateTime<Utc>,
) -> Result<WrongQuestionRecord, StorageError> {
    let row = sqlx::query(
        r"
            INSERT INTO wrong_questions (
                user_id, question_id, origin_exam_id, wrong_count,
                last_user_answer, last_wrong_at, created_at
            )
            VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)
            ON CONFLICT(user_id, question_id) DO UPDATE SET
                wrong_count = wrong_count + 1,
                last_user_answer = excluded.last_user_answer,
                last_wrong_at = excluded.last_wrong_at
            RETURNING
                id, user_id, question_id, origin_exam_id, wrong_count, correct_count,
                practice_count, mastered, last_user_answer, user_note, last_wrong_at,
                last_practice_at, mastered_at, created_at
        ",
    )
    .bind(user_id)
    .bind(id_i64("question_id", mistake.question_id.value())?)
    .bind(exam_id)
    .bind(mistake.user_answer.as_deref())
    .bind(now)
    .fetch_one(&mut *db)
    .await
    .map_err(conn)?;
    map_wrong_question_row(&row)
}

#[async_trait::async_trait]
impl WrongQuestionRepository for SqliteRepository {
    async fn record_mistakes(
        &self,
        user_id: UserId,
        exam_id: ExamId,
        mistakes: &[Mistake],
        now: DateTime<Utc>,
    ) -> Result<Vec<WrongQuestionRecord>, StorageError> {
        let user = id_i64("user_id", user_id.value())?;
        let exam = id_i64("exam_id", exam_id.value())?;

        let mut tx = self.pool.begin().await.map_err(conn)?;
        let mut out = Vec::with_capacity(mistakes.len());
        for mistake in mistakes {
            out.push(upsert_mistake(&mut *tx, user, exam, mistake, now).await?);
        }
        tx.commit().await.map_err(conn)?;
        Ok(out)
    }

    async fn record_practice(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        was_correct: bool,
        now: DateTime<Utc>,
    ) -> Result<WrongQuestionRecord, StorageError> {
        let row = sqlx::query(
            r"
                UPDATE wrong_questions
                SET practice_count = practice_count + 1,
                    correct_count = correct_count + ?3,
                    last_practice_at = ?4
                WHERE user_id = ?1 AND question_id = ?2
                RETURNING *
            ",
        )
        .bind(id_i64("user_id", user_id.value())?)
        .bind(id_i64("question_id", question_id.value())?)
        .bind(i64::from(was_correct))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;
        map_wrong_question_row(&row)
    }

    async fn mark_mastered(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        now: DateTime<Utc>,
    ) -> Result<WrongQuestionRecord, StorageError> {
        let row = sqlx::query(
            r"
                UPDATE wrong_questions
                SET mastered = 1,
                    mastered_at = COALESCE(mastered_at, ?3)
                WHERE user_id = ?1 AND question_id = ?2
                RETURNING *
            ",
        )
        .bind(id_i64("user_id", user_id.value())?)
        .bind(id_i64("question_id", question_id.value())?)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;
        map_wrong_question_row(&row)
    }

    async fn set_note(
        &self,
        user_id: UserId,
        question_id: QuestionId,
        note: Option<String>,
    ) -> Result<WrongQuestionRecord, StorageError> {
        let row = sqlx::query(
            r"
                UPDATE wrong_questions
                SET user_note = ?3
                WHERE user_id = ?1 AND question_id = ?2
                RETURNING *
            ",
        )
        .bind(id_i64("user_id", user_id.value())?)
        .bind(id_i64("question_id", question_id.value())?)
        .bind(note)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;
        map_wrong_question_row(&row)
    }

    async fn get_wrong_question(
        &self,
        user_id: UserId,
        question_id: QuestionId,
    ) -> Result<WrongQuestionRecord, StorageError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM wrong_questions w \
             WHERE w.user_id = ?1 AND w.question_id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(id_i64("user_id", user_id.value())?)
            .bind(id_i64("question_id", question_id.value())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        map_wrong_question_row(&row)
    }

    async fn list_wrong_questions(
        &self,
        user_id: UserId,
        filter: &WrongQuestionFilter,
    ) -> Result<Vec<WrongQuestionRecord>, StorageError> {
        let sql = format!(
            r"
                SELECT {LEDGER_COLUMNS}
                FROM wrong_questions w
                LEFT JOIN questions q ON q.id = w.question_id
                WHERE w.user_id = ?1
                  AND (?2 IS NULL OR q.difficulty = ?2)
                  AND (?3 IS NULL OR q.category = ?3)
                  AND (
                      ?4 IS NULL
                      OR (?4 = 'mastered' AND w.mastered = 1)
                      OR (?4 = 'unmastered' AND w.mastered = 0)
                      OR (?4 = 'intensive' AND {INTENSIVE_SQL})
                  )
                ORDER BY w.wrong_count DESC, w.last_wrong_at DESC, w.id ASC
                LIMIT ?5 OFFSET ?6
            "
        );
        // SQLite treats a negative LIMIT as "no limit".
        let limit = filter.limit.map_or(-1, i64::from);
        let rows = sqlx::query(&sql)
            .bind(id_i64("user_id", user_id.value())?)
            .bind(filter.difficulty.map(i64::from))
            .bind(filter.category.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(limit)
            .bind(i64::from(filter.offset))
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        rows.iter().map(map_wrong_question_row).collect()
    }

    async fn statistics(&self, user_id: UserId) -> Result<WrongQuestionStats, StorageError> {
        let user = id_i64("user_id", user_id.value())?;
        let sql = format!(
            r"
                SELECT
                    COUNT(*) AS total,
                    COALESCE(SUM(w.mastered = 1), 0) AS mastered,
                    COALESCE(SUM(w.mastered = 0), 0) AS unmastered,
                    COALESCE(SUM({INTENSIVE_SQL}), 0) AS intensive
                FROM wrong_questions w
                WHERE w.user_id = ?1
            "
        );
        let totals = sqlx::query(&sql)
            .bind(user)
            .fetch_one(&self.pool)
            .await
            .map_err(conn)?;

        let categories = sqlx::query(
            r"
                SELECT COALESCE(q.category, ?2) AS category, COUNT(*) AS n
                FROM wrong_questions w
                LEFT JOIN questions q ON q.id = w.question_id
                WHERE w.user_id = ?1
                GROUP BY 1
            ",
        )
        .bind(user)
        .bind(UNCATEGORIZED)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        let count = |row: &sqlx::sqlite::SqliteRow, column: &str| -> Result<u64, StorageError> {
            u64::try_from(row.try_get::<i64, _>(column).map_err(ser)?).map_err(ser)
        };
        let mut by_category = BTreeMap::new();
        for row in &categories {
            let name: String = row.try_get("category").map_err(ser)?;
            by_category.insert(name, count(row, "n")?);
        }

        Ok(WrongQuestionStats {
            total: count(&totals, "total")?,
            mastered: count(&totals, "mastered")?,
            unmastered: count(&totals, "unmastered")?,
            needs_intensive_practice: count(&totals, "intensive")?,
            by_category,
        })
    }

    async fn clear_mastered(&self, user_id: UserId) -> Result<u64, StorageError> {
        let res = sqlx::query("DELETE FROM wrong_questions WHERE user_id = ?1 AND mastered = 1")
            .bind(id_i64("user_id", user_id.value())?)
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(res.rows_affected())
    }

    async fn delete_for_user(&self, user_id: UserId) -> Result<u64, StorageError> {
        let res = sqlx::query("DELETE FROM wrong_questions WHERE user_id = ?1")
            .bind(id_i64("user_id", user_id.value())?)
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(res.rows_affected())
    }
}
