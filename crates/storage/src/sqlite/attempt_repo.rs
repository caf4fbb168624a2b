use chrono::{DateTime, Utc};
use exam_core::grading::{Mistake, Submission};
use exam_core::model::{AttemptId, AttemptState, ExamAttempt, ExamId, NewAttempt, UserId};
use sqlx::Row;

use super::{
    SqliteRepository, conn,
    mapping::{id_i64, map_attempt_row, ser, to_json},
    wrong_question_repo::upsert_mistake,
};
use crate::repository::{
    AttemptRepository, AttemptSlot, DraftOutcome, FinishOutcome, StorageError,
};

const ATTEMPT_COLUMNS: &str = "id, user_id, exam_id, attempt_number, state, started_at, \
     deadline, ended_at, score, correct_count, wrong_count, total_count, pass_score, \
     total_score, cheat_signal_count, flagged_cheating, snapshot, draft_answers, answers";

/// Guarded inserts tried before a start gives up with `Conflict`.
const START_TRIES: usize = 2;

impl SqliteRepository {
    async fn current_state(&self, id: i64) -> Result<AttemptState, StorageError> {
        let row = sqlx::query("SELECT state FROM attempts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        let state: String = row.try_get("state").map_err(ser)?;
        AttemptState::parse(&state).map_err(ser)
    }

    /// Explain why the guarded insert wrote nothing. `None` means the running
    /// attempt finished in between and the insert is worth another try.
    async fn refused_slot(
        &self,
        user_id: i64,
        exam_id: i64,
        retry_limit: u32,
    ) -> Result<Option<AttemptSlot>, StorageError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts \
             WHERE user_id = ?1 AND exam_id = ?2 AND state = 'in_progress'"
        );
        if let Some(row) = sqlx::query(&sql)
            .bind(user_id)
            .bind(exam_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
        {
            return Ok(Some(AttemptSlot::InProgress(map_attempt_row(&row)?)));
        }

        let used: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM attempts WHERE user_id = ?1 AND exam_id = ?2")
                .bind(user_id)
                .bind(exam_id)
                .fetch_one(&self.pool)
                .await
                .map_err(conn)?;
        let used = u32::try_from(used).map_err(ser)?;
        Ok((used >= retry_limit).then_some(AttemptSlot::LimitReached { used }))
    }

    /// The compare-and-set insert. `None` when a running attempt or the retry
    /// limit refused it.
    async fn insert_guarded(
        &self,
        attempt: &NewAttempt,
        user_id: i64,
        exam_id: i64,
        retry_limit: u32,
    ) -> Result<Option<(AttemptId, u32)>, StorageError> {
        let total_count = i64::try_from(attempt.snapshot.len()).map_err(ser)?;

        // One statement: the running-attempt check, the retry count and the
        // insert cannot interleave with another writer. The partial unique
        // index on in-progress attempts backs this up.
        let inserted = sqlx::query(
            r"
                INSERT INTO attempts (
                    user_id, exam_id, attempt_number, state, started_at, deadline,
                    total_count, pass_score, total_score, snapshot
                )
                SELECT
                    ?1, ?2,
                    (SELECT COALESCE(MAX(attempt_number), 0) + 1
                        FROM attempts WHERE user_id = ?1 AND exam_id = ?2),
                    'in_progress', ?3, ?4, ?5, ?6, ?7, ?8
                WHERE NOT EXISTS (
                        SELECT 1 FROM attempts
                        WHERE user_id = ?1 AND exam_id = ?2 AND state = 'in_progress'
                    )
                    AND (SELECT COUNT(*) FROM attempts
                        WHERE user_id = ?1 AND exam_id = ?2) < ?9
                RETURNING id, attempt_number
            ",
        )
        .bind(user_id)
        .bind(exam_id)
        .bind(attempt.started_at)
        .bind(attempt.deadline)
        .bind(total_count)
        .bind(i64::from(attempt.pass_score))
        .bind(i64::from(attempt.total_score))
        .bind(to_json(&attempt.snapshot)?)
        .bind(i64::from(retry_limit))
        .fetch_optional(&self.pool)
        .await;

        match inserted {
            Ok(Some(row)) => {
                let id = u64::try_from(row.try_get::<i64, _>("id").map_err(ser)?).map_err(ser)?;
                let number =
                    u32::try_from(row.try_get::<i64, _>("attempt_number").map_err(ser)?)
                        .map_err(ser)?;
                tracing::debug!(attempt_id = id, attempt_number = number, "attempt row inserted");
                Ok(Some((AttemptId::new(id), number)))
            }
            Ok(None) => Ok(None),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tracing::debug!(user_id, exam_id, "concurrent attempt insert rejected by index");
                Ok(None)
            }
            Err(e) => Err(conn(e)),
        }
    }
}

#[async_trait::async_trait]
impl AttemptRepository for SqliteRepository {
    async fn create_attempt(
        &self,
        attempt: NewAttempt,
        retry_limit: u32,
    ) -> Result<AttemptSlot, StorageError> {
        let user_id = id_i64("user_id", attempt.user_id.value())?;
        let exam_id = id_i64("exam_id", attempt.exam_id.value())?;

        for _ in 0..START_TRIES {
            if let Some((id, number)) = self
                .insert_guarded(&attempt, user_id, exam_id, retry_limit)
                .await?
            {
                return Ok(AttemptSlot::Created(attempt.assign(id, number)));
            }
            if let Some(slot) = self.refused_slot(user_id, exam_id, retry_limit).await? {
                return Ok(slot);
            }
            tracing::debug!(user_id, exam_id, "running attempt finished during start, retrying");
        }
        Err(StorageError::Conflict)
    }

    async fn get_attempt(&self, id: AttemptId) -> Result<ExamAttempt, StorageError> {
        let sql = format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id_i64("attempt_id", id.value())?)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?
            .ok_or(StorageError::NotFound)?;
        map_attempt_row(&row)
    }

    async fn list_attempts(
        &self,
        user_id: UserId,
        exam_id: ExamId,
    ) -> Result<Vec<ExamAttempt>, StorageError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts \
             WHERE user_id = ?1 AND exam_id = ?2 ORDER BY attempt_number ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(id_i64("user_id", user_id.value())?)
            .bind(id_i64("exam_id", exam_id.value())?)
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        rows.iter().map(map_attempt_row).collect()
    }

    async fn save_draft(
        &self,
        id: AttemptId,
        submission: &Submission,
    ) -> Result<DraftOutcome, StorageError> {
        let id = id_i64("attempt_id", id.value())?;
        // The merge runs inside SQLite, so a concurrent draft is never overwritten
        // with a stale copy.
        let sql = format!(
            "UPDATE attempts \
             SET draft_answers = json_patch(draft_answers, ?2), \
                 cheat_signal_count = MAX(cheat_signal_count, ?3) \
             WHERE id = ?1 AND state = 'in_progress' \
             RETURNING {ATTEMPT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(to_json(&submission.answers)?)
            .bind(i64::from(submission.cheat_signal_count))
            .fetch_optional(&self.pool)
            .await
            .map_err(conn)?;

        match row {
            Some(row) => Ok(DraftOutcome::Saved(map_attempt_row(&row)?)),
            None => Ok(DraftOutcome::AlreadyFinished(self.current_state(id).await?)),
        }
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
        let id = id_i64("attempt_id", finished.id().value())?;
        let user_id = id_i64("user_id", finished.user_id().value())?;
        let exam_id = id_i64("exam_id", finished.exam_id().value())?;

        let mut tx = self.pool.begin().await.map_err(conn)?;
        let res = sqlx::query(
            r"
                UPDATE attempts
                SET state = ?2,
                    ended_at = ?3,
                    score = ?4,
                    correct_count = ?5,
                    wrong_count = ?6,
                    cheat_signal_count = ?7,
                    flagged_cheating = ?8,
                    draft_answers = '{}',
                    answers = ?9
                WHERE id = ?1 AND state = 'in_progress'
            ",
        )
        .bind(id)
        .bind(finished.state().as_str())
        .bind(finished.ended_at())
        .bind(i64::from(finished.score()))
        .bind(i64::from(finished.correct_count()))
        .bind(i64::from(finished.wrong_count()))
        .bind(i64::from(finished.cheat_signal_count()))
        .bind(finished.flagged_cheating())
        .bind(to_json(&finished.answers())?)
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        if res.rows_affected() == 0 {
            tx.rollback().await.map_err(conn)?;
            return Ok(FinishOutcome::AlreadyFinished(self.current_state(id).await?));
        }

        for mistake in mistakes {
            upsert_mistake(&mut *tx, user_id, exam_id, mistake, now).await?;
        }
        tx.commit().await.map_err(conn)?;
        Ok(FinishOutcome::Finished)
    }

    async fn list_overdue(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExamAttempt>, StorageError> {
        let sql = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts \
             WHERE state = 'in_progress' AND deadline < ?1 \
             ORDER BY deadline ASC, id ASC LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(conn)?;
        rows.iter().map(map_attempt_row).collect()
    }
}
