//! Quiz sessions over generated questions
//!
//! Questions are generated lazily from the episode's transcript the first
//! time anyone asks for the quiz. Each user has at most one in-progress
//! session per episode; answers are graded on submission and counted into
//! the session, which completes itself when the last question is answered.

mod generation;
mod grading;


use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::database::{
    conflict_of, Conflict, Database, NewAnswer, Question, QuestionType, QuizSession,
    SessionStatus, UserAnswer,
};
use crate::error::AppError;
use crate::llm::ChatModel;

#[derive(Debug, Clone)]
pub struct QuizConfig {
    pub generation_timeout: Duration,
    pub grading_timeout: Duration,
}

impl Default for QuizConfig {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(60),
            grading_timeout: Duration::from_secs(25),
        }
    }
}

/// A session together with its episode's questions and the answers so far.
#[derive(Debug, Clone, Serialize)]
pub struct QuizDetail {
    pub session: QuizSession,
    pub questions: Vec<Question>,
    pub answers: Vec<UserAnswer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerSubmission {
    pub question_id: i64,
    #[serde(default)]
    pub selected_option_id: Option<i64>,
    #[serde(default)]
    pub text_answer: Option<String>,
}

impl AnswerSubmission {
    /// Exactly one of `selected_option_id` / `text_answer` must be given.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.question_id <= 0 {
            return Err(AppError::Validation(
                "question_id must be a positive integer".to_string(),
            ));
        }
        let has_text = self
            .text_answer
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        match (self.selected_option_id.is_some(), has_text) {
            (true, false) | (false, true) => Ok(()),
            (true, true) => Err(AppError::Validation(
                "provide either selected_option_id or text_answer, not both".to_string(),
            )),
            (false, false) => Err(AppError::Validation(
                "one of selected_option_id or text_answer is required".to_string(),
            )),
        }
    }
}

pub struct QuizEngine {
    db: Arc<Database>,
    llm: Arc<dyn ChatModel>,
    config: QuizConfig,
}

impl QuizEngine {
    pub fn new(db: Arc<Database>, llm: Arc<dyn ChatModel>, config: QuizConfig) -> Self {
        Self { db, llm, config }
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Resolve the user's quiz for an episode, generating questions and
    /// starting a session as needed.
    pub async fn get_or_create(&self, user_id: i64, episode_id: i64) -> Result<QuizDetail, AppError> {
        if episode_id <= 0 {
            return Err(AppError::Validation(
                "episode_id must be a positive integer".to_string(),
            ));
        }
        if self.db.get_episode(episode_id)?.is_none() {
            return Err(AppError::NotFound(format!("episode {}", episode_id)));
        }

        let mut questions = self.db.get_questions_by_episode(episode_id)?;
        if questions.is_empty() {
            questions = generation::generate_questions(
                &self.db,
                self.llm.as_ref(),
                self.config.generation_timeout,
                episode_id,
            )
            .await?;
        }

        let session = match self.db.get_latest_session(user_id, episode_id)? {
            Some(existing) => existing,
            None => self.start_session(user_id, episode_id, questions.len() as i64)?,
        };

        let answers = self.db.list_answers_by_session(session.id)?;
        Ok(QuizDetail {
            session,
            questions,
            answers,
        })
    }

    fn start_session(&self, user_id: i64, episode_id: i64, total: i64) -> Result<QuizSession, AppError> {
        match self.db.create_session(user_id, episode_id, total) {
            Ok(session) => {
                log::info!(
                    "Started quiz session {} for user {} on episode {} ({} questions)",
                    session.id,
                    user_id,
                    episode_id,
                    total
                );
                Ok(session)
            }
            // Lost a race with a concurrent request; use the winner's session
            Err(e) if conflict_of(&e) == Some(Conflict::ActiveSessionExists) => self
                .db
                .get_latest_session(user_id, episode_id)?
                .ok_or_else(|| AppError::Internal("active session disappeared".to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_quizzes(&self, user_id: i64) -> Result<Vec<QuizDetail>, AppError> {
        self.db
            .list_sessions_by_user(user_id)?
            .into_iter()
            .map(|session| self.detail(session))
            .collect()
    }

    /// A session the user owns. Other users' sessions look missing.
    pub fn get_quiz(&self, user_id: i64, session_id: i64) -> Result<QuizDetail, AppError> {
        let session = self
            .db
            .get_session(session_id)?
            .filter(|s| s.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;
        self.detail(session)
    }

    pub fn delete_quiz(&self, user_id: i64, session_id: i64) -> Result<(), AppError> {
        self.owned_session(session_id, user_id)?;
        if !self.db.delete_session(session_id)? {
            return Err(AppError::NotFound(format!("session {}", session_id)));
        }
        log::info!("Deleted quiz session {} for user {}", session_id, user_id);
        Ok(())
    }

    /// Close a session as `completed` or `abandoned`.
    ///
    /// `completed_at` is stamped on the first close and kept afterwards.
    pub fn update_session_status(
        &self,
        session_id: i64,
        user_id: i64,
        target: &str,
    ) -> Result<QuizSession, AppError> {
        let status = match SessionStatus::parse(target) {
            Some(status @ (SessionStatus::Completed | SessionStatus::Abandoned)) => status,
            _ => {
                return Err(AppError::Validation(format!(
                    "status must be \"completed\" or \"abandoned\", got {:?}",
                    target
                )))
            }
        };

        self.owned_session(session_id, user_id)?;
        let updated = self.db.set_session_status(session_id, status)?;
        log::info!("Quiz session {} is now {}", session_id, status);
        Ok(updated)
    }

    // =========================================================================
    // Answers
    // =========================================================================

    pub async fn submit_answer(
        &self,
        session_id: i64,
        user_id: i64,
        submission: AnswerSubmission,
    ) -> Result<UserAnswer, AppError> {
        submission.validate()?;

        let session = self.owned_session(session_id, user_id)?;
        if session.status != SessionStatus::InProgress {
            return Err(Conflict::SessionClosed.into());
        }
        if self
            .db
            .get_answer(session_id, submission.question_id)?
            .is_some()
        {
            return Err(Conflict::AlreadyAnswered.into());
        }

        let question = self
            .db
            .get_question(submission.question_id)?
            .ok_or_else(|| AppError::NotFound(format!("question {}", submission.question_id)))?;
        if question.episode_id != session.episode_id {
            return Err(AppError::Validation(format!(
                "question {} does not belong to this quiz",
                question.id
            )));
        }

        let grade = match question.question_type {
            QuestionType::MultipleChoice | QuestionType::TrueFalse => {
                let option_id = submission.selected_option_id.ok_or_else(|| {
                    AppError::Validation(format!(
                        "selected_option_id is required for {} questions",
                        question.question_type
                    ))
                })?;
                let option = question
                    .options
                    .iter()
                    .find(|o| o.id == option_id)
                    .ok_or_else(|| {
                        AppError::Validation(format!(
                            "option {} does not belong to question {}",
                            option_id, question.id
                        ))
                    })?;
                grading::grade_choice(
                    self.llm.as_ref(),
                    self.config.grading_timeout,
                    &question,
                    option,
                )
                .await
            }
            QuestionType::OpenEnded => {
                let text = submission
                    .text_answer
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        AppError::Validation(
                            "text_answer is required for open_ended questions".to_string(),
                        )
                    })?;
                let context = generation::transcript_text(&self.db, session.episode_id)?;
                grading::grade_open_ended(
                    self.llm.as_ref(),
                    self.config.grading_timeout,
                    &question,
                    text,
                    context.as_deref(),
                )
                .await
            }
        };

        let (answer, session) = self
            .db
            .record_answer(&NewAnswer {
                session_id,
                question_id: question.id,
                user_id,
                selected_option_id: submission.selected_option_id,
                text_answer: submission.text_answer.map(|t| t.trim().to_string()),
                is_correct: grade.is_correct,
                feedback: grade.feedback,
            })
            .map_err(store_error)?;

        log::info!(
            "Session {} answered question {} ({}): {}/{} answered, {} correct",
            session.id,
            question.id,
            if answer.is_correct { "correct" } else { "incorrect" },
            session.answered_questions,
            session.total_questions,
            session.correct_answers
        );
        if session.status == SessionStatus::Completed {
            log::info!("Quiz session {} completed", session.id);
        }

        Ok(answer)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn owned_session(&self, session_id: i64, user_id: i64) -> Result<QuizSession, AppError> {
        let session = self
            .db
            .get_session(session_id)?
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;
        if session.user_id != user_id {
            return Err(AppError::Forbidden(format!(
                "session {} belongs to another user",
                session_id
            )));
        }
        Ok(session)
    }

    fn detail(&self, session: QuizSession) -> Result<QuizDetail, AppError> {
        let questions = self.db.get_questions_by_episode(session.episode_id)?;
        let answers = self.db.list_answers_by_session(session.id)?;
        Ok(QuizDetail {
            session,
            questions,
            answers,
        })
    }
}

/// Classify a store error, keeping typed conflicts as conflicts.
fn store_error(e: anyhow::Error) -> AppError {
    match conflict_of(&e) {
        Some(conflict) => conflict.into(),
        None => e.into(),
    }
}
