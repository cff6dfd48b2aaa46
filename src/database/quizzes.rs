use std::collections::HashMap;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::*;
use super::{is_unique_violation, Conflict, Database};

const SESSION_COLUMNS: &str = "id, user_id, episode_id, status, total_questions, \
     answered_questions, correct_answers, started_at, completed_at, updated_at";

const ANSWER_COLUMNS: &str = "id, session_id, question_id, user_id, selected_option_id, \
     text_answer, is_correct, feedback, answered_at";

impl Database {
    // =========================================================================
    // Questions
    // =========================================================================

    pub fn create_question(
        &self,
        episode_id: i64,
        question_text: &str,
        question_type: QuestionType,
        position: i64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO questions (episode_id, question_text, type, position)
             VALUES (?1, ?2, ?3, ?4)",
            params![episode_id, question_text, question_type.as_str(), position],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_question_option(
        &self,
        question_id: i64,
        option_text: &str,
        position: i64,
        is_correct: bool,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO question_options (question_id, option_text, position, is_correct)
             VALUES (?1, ?2, ?3, ?4)",
            params![question_id, option_text, position, is_correct],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Questions for an episode in position order, each with its options.
    pub fn get_questions_by_episode(&self, episode_id: i64) -> Result<Vec<Question>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, episode_id, question_text, type, position
             FROM questions WHERE episode_id = ?1
             ORDER BY position ASC, id ASC",
        )?;
        let mut questions = stmt
            .query_map(params![episode_id], question_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT o.id, o.question_id, o.option_text, o.position, o.is_correct
             FROM question_options o
             JOIN questions q ON q.id = o.question_id
             WHERE q.episode_id = ?1
             ORDER BY o.question_id ASC, o.position ASC, o.id ASC",
        )?;
        let mut options_by_question: HashMap<i64, Vec<QuestionOption>> = HashMap::new();
        for option in stmt.query_map(params![episode_id], option_from_row)? {
            let option = option?;
            options_by_question
                .entry(option.question_id)
                .or_default()
                .push(option);
        }

        for question in &mut questions {
            if let Some(options) = options_by_question.remove(&question.id) {
                question.options = options;
            }
        }

        Ok(questions)
    }

    pub fn get_question(&self, question_id: i64) -> Result<Option<Question>> {
        let conn = self.conn()?;
        let question = conn
            .query_row(
                "SELECT id, episode_id, question_text, type, position
                 FROM questions WHERE id = ?1",
                params![question_id],
                question_from_row,
            )
            .optional()?;

        let Some(mut question) = question else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, question_id, option_text, position, is_correct
             FROM question_options WHERE question_id = ?1
             ORDER BY position ASC, id ASC",
        )?;
        question.options = stmt
            .query_map(params![question_id], option_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(question))
    }

    /// Remove every question (and, by cascade, option) for an episode.
    pub fn delete_questions_by_episode(&self, episode_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM questions WHERE episode_id = ?1",
            params![episode_id],
        )?;
        Ok(deleted)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Start an `in_progress` session.
    ///
    /// Fails with [`Conflict::ActiveSessionExists`] when the user already has
    /// one for this episode.
    pub fn create_session(
        &self,
        user_id: i64,
        episode_id: i64,
        total_questions: i64,
    ) -> Result<QuizSession> {
        let conn = self.conn()?;
        let now = Utc::now();

        let inserted = conn.execute(
            "INSERT INTO user_quiz_sessions
                (user_id, episode_id, status, total_questions, answered_questions,
                 correct_answers, started_at, updated_at)
             VALUES (?1, ?2, 'in_progress', ?3, 0, 0, ?4, ?4)",
            params![user_id, episode_id, total_questions, now],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(Conflict::ActiveSessionExists.into()),
            Err(e) => return Err(e.into()),
        }

        let id = conn.last_insert_rowid();
        fetch_session(&conn, id)?.ok_or_else(|| anyhow!("session {} vanished after insert", id))
    }

    pub fn get_session(&self, session_id: i64) -> Result<Option<QuizSession>> {
        let conn = self.conn()?;
        fetch_session(&conn, session_id)
    }

    /// The user's most recently started session for an episode, any status.
    pub fn get_latest_session(&self, user_id: i64, episode_id: i64) -> Result<Option<QuizSession>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM user_quiz_sessions
             WHERE user_id = ?1 AND episode_id = ?2
             ORDER BY started_at DESC, id DESC
             LIMIT 1",
            SESSION_COLUMNS
        );
        let session = conn
            .query_row(&sql, params![user_id, episode_id], session_from_row)
            .optional()?;
        Ok(session)
    }

    pub fn list_sessions_by_user(&self, user_id: i64) -> Result<Vec<QuizSession>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM user_quiz_sessions
             WHERE user_id = ?1
             ORDER BY updated_at DESC, id DESC",
            SESSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params![user_id], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Move a session to `status`, leaving the answer counters alone.
    ///
    /// Closing stamps `completed_at` the first time and keeps it afterwards.
    pub fn set_session_status(&self, session_id: i64, status: SessionStatus) -> Result<QuizSession> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE user_quiz_sessions SET
                status = ?1,
                completed_at = CASE WHEN ?1 = 'in_progress' THEN NULL
                                    ELSE COALESCE(completed_at, ?2) END,
                updated_at = ?2
             WHERE id = ?3",
            params![status.as_str(), Utc::now(), session_id],
        )?;

        if updated == 0 {
            return Err(anyhow!("session {} does not exist", session_id));
        }
        fetch_session(&conn, session_id)?
            .ok_or_else(|| anyhow!("session {} vanished after update", session_id))
    }

    /// Delete a session and, by cascade, its answers. Returns whether a row existed.
    pub fn delete_session(&self, session_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM user_quiz_sessions WHERE id = ?1",
            params![session_id],
        )?;
        Ok(deleted > 0)
    }

    // =========================================================================
    // Answers
    // =========================================================================

    /// Record a graded answer and bump the session counters in one transaction.
    ///
    /// The session flips to `completed` when the last question is answered.
    /// Fails with [`Conflict::SessionClosed`] if the session left
    /// `in_progress` meanwhile, or [`Conflict::AlreadyAnswered`] on a
    /// duplicate `(session, question)`.
    pub fn record_answer(&self, answer: &NewAnswer) -> Result<(UserAnswer, QuizSession)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let session = fetch_session(&tx, answer.session_id)?
            .ok_or_else(|| anyhow!("session {} does not exist", answer.session_id))?;
        if session.status != SessionStatus::InProgress {
            return Err(Conflict::SessionClosed.into());
        }

        let inserted = tx.execute(
            "INSERT INTO user_answers
                (session_id, question_id, user_id, selected_option_id, text_answer,
                 is_correct, feedback, answered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                answer.session_id,
                answer.question_id,
                answer.user_id,
                answer.selected_option_id,
                answer.text_answer,
                answer.is_correct,
                answer.feedback,
                now,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(Conflict::AlreadyAnswered.into()),
            Err(e) => return Err(e.into()),
        }
        let answer_id = tx.last_insert_rowid();

        let answered = session.answered_questions + 1;
        let correct = session.correct_answers + i64::from(answer.is_correct);
        let finished = answered >= session.total_questions;

        tx.execute(
            "UPDATE user_quiz_sessions SET
                answered_questions = ?1,
                correct_answers = ?2,
                status = CASE WHEN ?3 THEN 'completed' ELSE status END,
                completed_at = CASE WHEN ?3 THEN COALESCE(completed_at, ?4) ELSE completed_at END,
                updated_at = ?4
             WHERE id = ?5",
            params![answered, correct, finished, now, session.id],
        )?;

        let recorded = fetch_answer_by_id(&tx, answer_id)?
            .ok_or_else(|| anyhow!("answer {} vanished after insert", answer_id))?;
        let session = fetch_session(&tx, session.id)?
            .ok_or_else(|| anyhow!("session {} vanished during answer", session.id))?;

        tx.commit()?;
        Ok((recorded, session))
    }

    pub fn get_answer(&self, session_id: i64, question_id: i64) -> Result<Option<UserAnswer>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM user_answers WHERE session_id = ?1 AND question_id = ?2",
            ANSWER_COLUMNS
        );
        let answer = conn
            .query_row(&sql, params![session_id, question_id], answer_from_row)
            .optional()?;
        Ok(answer)
    }

    pub fn list_answers_by_session(&self, session_id: i64) -> Result<Vec<UserAnswer>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM user_answers WHERE session_id = ?1
             ORDER BY answered_at ASC, id ASC",
            ANSWER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let answers = stmt
            .query_map(params![session_id], answer_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(answers)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn fetch_session(conn: &Connection, session_id: i64) -> Result<Option<QuizSession>> {
    let sql = format!(
        "SELECT {} FROM user_quiz_sessions WHERE id = ?1",
        SESSION_COLUMNS
    );
    let session = conn
        .query_row(&sql, params![session_id], session_from_row)
        .optional()?;
    Ok(session)
}

fn fetch_answer_by_id(conn: &Connection, answer_id: i64) -> Result<Option<UserAnswer>> {
    let sql = format!("SELECT {} FROM user_answers WHERE id = ?1", ANSWER_COLUMNS);
    let answer = conn
        .query_row(&sql, params![answer_id], answer_from_row)
        .optional()?;
    Ok(answer)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<QuizSession> {
    Ok(QuizSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        episode_id: row.get(2)?,
        status: row.get::<_, String>(3)?.into(),
        total_questions: row.get(4)?,
        answered_questions: row.get(5)?,
        correct_answers: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn answer_from_row(row: &Row<'_>) -> rusqlite::Result<UserAnswer> {
    Ok(UserAnswer {
        id: row.get(0)?,
        session_id: row.get(1)?,
        question_id: row.get(2)?,
        user_id: row.get(3)?,
        selected_option_id: row.get(4)?,
        text_answer: row.get(5)?,
        is_correct: row.get(6)?,
        feedback: row.get(7)?,
        answered_at: row.get(8)?,
    })
}

fn question_from_row(row: &Row<'_>) -> rusqlite::Result<Question> {
    let raw_type: String = row.get(3)?;
    let question_type = QuestionType::parse(&raw_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown question type {:?}", raw_type).into(),
        )
    })?;

    Ok(Question {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        question_text: row.get(2)?,
        question_type,
        position: row.get(4)?,
        options: Vec::new(),
    })
}

fn option_from_row(row: &Row<'_>) -> rusqlite::Result<QuestionOption> {
    Ok(QuestionOption {
        id: row.get(0)?,
        question_id: row.get(1)?,
        option_text: row.get(2)?,
        position: row.get(3)?,
        is_correct: row.get(4)?,
    })
}
