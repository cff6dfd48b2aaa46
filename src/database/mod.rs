pub mod models;
mod quizzes;
mod transcripts;


use anyhow::{anyhow, Context, Result};
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub use models::*;
pub use transcripts::CHUNK_BATCH_SIZE;

/// Store-level conflicts the quiz engine needs to tell apart.
///
/// These travel inside `anyhow::Error`; use [`conflict_of`] to recover them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Conflict {
    #[error("question already answered in this session")]
    AlreadyAnswered,
    #[error("session is not in progress")]
    SessionClosed,
    #[error("an in-progress session already exists for this episode")]
    ActiveSessionExists,
}

/// Recover a typed [`Conflict`] from a store error, if that is what it is.
pub fn conflict_of(err: &anyhow::Error) -> Option<Conflict> {
    err.downcast_ref::<Conflict>().copied()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database at {:?}", db_path))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open the database named by a `DATABASE_URL`.
    ///
    /// Accepts `sqlite://<path>`, `sqlite:<path>`, a plain path, or
    /// `sqlite::memory:`.
    pub fn connect(database_url: &str) -> Result<Self> {
        let target = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        if target == ":memory:" {
            return Self::open_in_memory();
        }

        let path = Path::new(target);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {:?}", parent))?;
        }
        Self::new(path)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // WAL for concurrent readers; cascades need foreign keys on
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=5000;
        ",
        )?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL DEFAULT '',
                description TEXT,
                audio_url TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transcripts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'processing'
                    CHECK (status IN ('processing', 'complete', 'failed')),
                error_message TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS transcript_chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transcript_id INTEGER NOT NULL,
                position INTEGER NOT NULL CHECK (position >= 0),
                speaker_index INTEGER NOT NULL DEFAULT 0 CHECK (speaker_index >= 0),
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                text TEXT NOT NULL,
                FOREIGN KEY (transcript_id) REFERENCES transcripts(id) ON DELETE CASCADE,
                UNIQUE(transcript_id, position)
            );

            CREATE TABLE IF NOT EXISTS transcript_speakers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transcript_id INTEGER NOT NULL,
                speaker_index INTEGER NOT NULL,
                speaker_name TEXT NOT NULL,
                inferred_at TEXT NOT NULL,
                FOREIGN KEY (transcript_id) REFERENCES transcripts(id) ON DELETE CASCADE,
                UNIQUE(transcript_id, speaker_index)
            );

            CREATE TABLE IF NOT EXISTS questions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL,
                question_text TEXT NOT NULL,
                type TEXT NOT NULL
                    CHECK (type IN ('multiple_choice', 'true_false', 'open_ended')),
                position INTEGER NOT NULL,
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_questions_episode ON questions(episode_id, position);

            CREATE TABLE IF NOT EXISTS question_options (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question_id INTEGER NOT NULL,
                option_text TEXT NOT NULL,
                position INTEGER NOT NULL,
                is_correct INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (question_id) REFERENCES questions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_question_options_question
                ON question_options(question_id, position);

            CREATE TABLE IF NOT EXISTS user_quiz_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                episode_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'in_progress'
                    CHECK (status IN ('in_progress', 'completed', 'abandoned')),
                total_questions INTEGER NOT NULL DEFAULT 0 CHECK (total_questions >= 0),
                answered_questions INTEGER NOT NULL DEFAULT 0
                    CHECK (answered_questions >= 0 AND answered_questions <= total_questions),
                correct_answers INTEGER NOT NULL DEFAULT 0
                    CHECK (correct_answers >= 0 AND correct_answers <= answered_questions),
                started_at TEXT NOT NULL,
                completed_at TEXT,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user_episode
                ON user_quiz_sessions(user_id, episode_id, started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_sessions_user_updated
                ON user_quiz_sessions(user_id, updated_at DESC);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_single_active
                ON user_quiz_sessions(user_id, episode_id) WHERE status = 'in_progress';

            CREATE TABLE IF NOT EXISTS user_answers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                question_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                selected_option_id INTEGER,
                text_answer TEXT,
                is_correct INTEGER NOT NULL DEFAULT 0,
                feedback TEXT NOT NULL DEFAULT '',
                answered_at TEXT NOT NULL,
                CHECK ((selected_option_id IS NULL) <> (text_answer IS NULL)),
                FOREIGN KEY (session_id) REFERENCES user_quiz_sessions(id) ON DELETE CASCADE,
                FOREIGN KEY (question_id) REFERENCES questions(id) ON DELETE CASCADE,
                FOREIGN KEY (selected_option_id) REFERENCES question_options(id) ON DELETE CASCADE,
                UNIQUE(session_id, question_id)
            );

            CREATE INDEX IF NOT EXISTS idx_user_answers_session
                ON user_answers(session_id, answered_at);
        "#,
        )?;

        Ok(())
    }
}
