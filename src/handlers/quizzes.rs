use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use super::auth::AuthUser;
use crate::database::{QuizSession, UserAnswer};
use crate::error::AppError;
use crate::quiz::{AnswerSubmission, QuizDetail};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateQuizRequest {
    pub episode_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| AppError::Validation(e.body_text()))
}

fn session_id(path: Result<Path<i64>, PathRejection>) -> Result<i64, AppError> {
    let Path(id) = path.map_err(|e| AppError::Validation(e.body_text()))?;
    if id <= 0 {
        return Err(AppError::Validation(
            "session id must be a positive integer".to_string(),
        ));
    }
    Ok(id)
}

/// `GET /quizzes`
pub async fn list_quizzes(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<QuizDetail>>, AppError> {
    Ok(Json(state.quizzes.list_quizzes(user_id)?))
}

/// `POST /quizzes`
pub async fn create_quiz(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<CreateQuizRequest>, JsonRejection>,
) -> Result<Json<QuizDetail>, AppError> {
    let request = body(payload)?;
    let detail = state
        .quizzes
        .get_or_create(user_id, request.episode_id)
        .await?;
    Ok(Json(detail))
}

/// `GET /quizzes/{session_id}`
pub async fn get_quiz(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<QuizDetail>, AppError> {
    let session_id = session_id(path)?;
    Ok(Json(state.quizzes.get_quiz(user_id, session_id)?))
}

/// `DELETE /quizzes/{session_id}`
pub async fn delete_quiz(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    path: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, AppError> {
    let session_id = session_id(path)?;
    state.quizzes.delete_quiz(user_id, session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /quizzes/{session_id}/answers`
pub async fn submit_answer(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<AnswerSubmission>, JsonRejection>,
) -> Result<(StatusCode, Json<UserAnswer>), AppError> {
    let session_id = session_id(path)?;
    let submission = body(payload)?;
    let answer = state
        .quizzes
        .submit_answer(session_id, user_id, submission)
        .await?;
    Ok((StatusCode::CREATED, Json(answer)))
}

/// `PATCH /quizzes/{session_id}/status`
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<UpdateStatusRequest>, JsonRejection>,
) -> Result<Json<QuizSession>, AppError> {
    let session_id = session_id(path)?;
    let request = body(payload)?;
    let session = state
        .quizzes
        .update_session_status(session_id, user_id, &request.status)?;
    Ok(Json(session))
}
