use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Statements for schema version 1, applied in order inside one transaction.
const V1_SCHEMA: &[&str] = &[
    r"
        CREATE TABLE IF NOT EXISTS questions (
            id INTEGER PRIMARY KEY,
            content TEXT NOT NULL,
            question_type TEXT NOT NULL,
            options TEXT NOT NULL,
            correct_answer TEXT NOT NULL,
            explanation TEXT,
            score INTEGER NOT NULL CHECK (score >= 0),
            difficulty INTEGER NOT NULL CHECK (difficulty BETWEEN 1 AND 5),
            category TEXT,
            status TEXT NOT NULL
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS exams (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL CHECK (duration_minutes > 0),
            total_score INTEGER NOT NULL CHECK (total_score >= 0),
            pass_score INTEGER NOT NULL CHECK (pass_score >= 0),
            start_window TEXT,
            end_window TEXT,
            retry_limit INTEGER NOT NULL CHECK (retry_limit >= 1),
            status TEXT NOT NULL
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS exam_questions (
            exam_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            question_id INTEGER NOT NULL,
            score INTEGER NOT NULL CHECK (score >= 0),
            PRIMARY KEY (exam_id, position),
            UNIQUE (exam_id, question_id),
            FOREIGN KEY (exam_id) REFERENCES exams(id) ON DELETE CASCADE,
            FOREIGN KEY (question_id) REFERENCES questions(id)
        );
    ",
    r"
        CREATE TABLE IF NOT EXISTS attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            exam_id INTEGER NOT NULL,
            attempt_number INTEGER NOT NULL CHECK (attempt_number >= 1),
            state TEXT NOT NULL
                CHECK (state IN ('in_progress', 'pass', 'fail', 'timeout', 'cheating')),
            started_at TEXT NOT NULL,
            deadline TEXT NOT NULL,
            ended_at TEXT,
            score INTEGER NOT NULL DEFAULT 0,
            correct_count INTEGER NOT NULL DEFAULT 0,
            wrong_count INTEGER NOT NULL DEFAULT 0,
            total_count INTEGER NOT NULL,
            pass_score INTEGER NOT NULL,
            total_score INTEGER NOT NULL,
            cheat_signal_count INTEGER NOT NULL DEFAULT 0,
            flagged_cheating INTEGER NOT NULL DEFAULT 0,
            snapshot TEXT NOT NULL,
            draft_answers TEXT NOT NULL DEFAULT '{}',
            answers TEXT NOT NULL DEFAULT '[]',
            UNIQUE (user_id, exam_id, attempt_number),
            CHECK ((state = 'in_progress') = (ended_at IS NULL)),
            FOREIGN KEY (exam_id) REFERENCES exams(id)
        );
    ",
    r"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_attempts_one_in_progress
            ON attempts (user_id, exam_id)
            WHERE state = 'in_progress';
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_attempts_state_deadline
            ON attempts (state, deadline);
    ",
    r"
        CREATE TABLE IF NOT EXISTS wrong_questions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            question_id INTEGER NOT NULL,
            origin_exam_id INTEGER NOT NULL,
            wrong_count INTEGER NOT NULL CHECK (wrong_count >= 1),
            correct_count INTEGER NOT NULL DEFAULT 0 CHECK (correct_count >= 0),
            practice_count INTEGER NOT NULL DEFAULT 0 CHECK (practice_count >= correct_count),
            mastered INTEGER NOT NULL DEFAULT 0,
            last_user_answer TEXT,
            user_note TEXT,
            last_wrong_at TEXT NOT NULL,
            last_practice_at TEXT,
            mastered_at TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (user_id, question_id)
        );
    ",
    r"
        CREATE INDEX IF NOT EXISTS idx_wrong_questions_user_rank
            ON wrong_questions (user_id, wrong_count DESC, last_wrong_at DESC);
    ",
];

/// Runs the versioned migrations recorded in `schema_migrations`.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;
        for statement in V1_SCHEMA.iter().copied() {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        tracing::info!(version = 1, "applied schema migration");
    }

    Ok(())
}
