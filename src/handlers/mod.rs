//! HTTP surface
//!
//! # Routes
//!
//! - `GET /status` - Liveness check (public)
//! - `GET /transcripts/stream/sse?episode_id=<id>` - Transcript as server-sent events
//! - `GET /quizzes` - The caller's quizzes
//! - `POST /quizzes` - Get or create the caller's quiz for an episode
//! - `GET /quizzes/{session_id}` - One quiz
//! - `DELETE /quizzes/{session_id}` - Delete a quiz and its answers
//! - `POST /quizzes/{session_id}/answers` - Submit an answer
//! - `PATCH /quizzes/{session_id}/status` - Complete or abandon a quiz
//!
//! Every route except `/status` needs an authenticated user (see [`auth::AuthUser`]).

pub mod auth;
mod quizzes;
mod transcripts;

use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS configuration for browser clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(status))
        // Transcripts
        .route(
            "/transcripts/stream/sse",
            get(transcripts::stream_transcript),
        )
        // Quizzes
        .route(
            "/quizzes",
            get(quizzes::list_quizzes).post(quizzes::create_quiz),
        )
        .route(
            "/quizzes/{session_id}",
            get(quizzes::get_quiz).delete(quizzes::delete_quiz),
        )
        .route("/quizzes/{session_id}/answers", post(quizzes::submit_answer))
        .route("/quizzes/{session_id}/status", patch(quizzes::update_status))
        // Middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::auth::USER_ID_HEADER;
    use super::*;
    use crate::database::Database;
    use crate::pipeline::{PipelineConfig, TranscriptPipeline};
    use crate::quiz::{QuizConfig, QuizEngine};
    use crate::testing::{
        seed_complete_transcript, seed_episode, setup_test_db, ScriptedLlm, ScriptedStt,
    };
    use crate::transcription::WordEvent;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use tower::ServiceExt;

    const QUIZ_REPLY: &str = r#"{"questions": [
        {"question_text": "Best flavor?", "type": "multiple_choice", "options": [
            {"option_text": "Mint", "is_correct": true},
            {"option_text": "Plain", "is_correct": false}]},
        {"question_text": "Recorded live?", "type": "true_false", "options": [
            {"option_text": "True", "is_correct": false},
            {"option_text": "False", "is_correct": true}]},
        {"question_text": "Why?", "type": "open_ended", "options": []}
    ]}"#;

    fn app(db: Arc<Database>, words: Vec<WordEvent>) -> Router {
        let llm = Arc::new(ScriptedLlm::new(|request| {
            let system = &request.messages[0].content;
            if system.contains("comprehension quizzes") {
                Ok(QUIZ_REPLY.to_string())
            } else if system.contains("identify speakers") {
                Ok(r#"{"name": "Alice"}"#.to_string())
            } else {
                Ok("Well done.".to_string())
            }
        }));
        let state = AppState {
            db: db.clone(),
            pipeline: Arc::new(TranscriptPipeline::new(
                db.clone(),
                Arc::new(ScriptedStt::new(words)),
                llm.clone(),
                PipelineConfig::default(),
            )),
            quizzes: Arc::new(QuizEngine::new(db, llm, QuizConfig::default())),
        };
        create_router(Arc::new(state))
    }

    fn request(method: Method, uri: &str, user: Option<i64>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user.to_string());
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_status_is_public() {
        let (db, _temp) = setup_test_db();
        let app = app(db, Vec::new());
        let (status, body) = send(&app, request(Method::GET, "/status", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_quiz_routes_require_identity() {
        let (db, _temp) = setup_test_db();
        let app = app(db, Vec::new());
        let (status, body) = send(&app, request(Method::GET, "/quizzes", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "unauthorized");
    }

    #[tokio::test]
    async fn test_quiz_flow_over_http() {
        let (db, _temp) = setup_test_db();
        let episode_id = seed_episode(&db, None);
        seed_complete_transcript(&db, episode_id, &[("Mint", 0), ("rules", 0)]);
        let app = app(db, Vec::new());

        let (status, quiz) = send(
            &app,
            request(Method::POST, "/quizzes", Some(1), Some(json!({ "episode_id": episode_id }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(quiz["session"]["total_questions"], 3);
        assert_eq!(quiz["questions"][0]["type"], "multiple_choice");
        let session_id = quiz["session"]["id"].as_i64().unwrap();
        let question_id = quiz["questions"][0]["id"].as_i64().unwrap();
        let correct_option = quiz["questions"][0]["options"][0]["id"].as_i64().unwrap();

        let answer_uri = format!("/quizzes/{}/answers", session_id);
        let (status, answer) = send(
            &app,
            request(
                Method::POST,
                &answer_uri,
                Some(1),
                Some(json!({ "question_id": question_id, "selected_option_id": correct_option })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(answer["is_correct"], true);
        assert_eq!(answer["feedback"], "Well done.");

        // Duplicate answer
        let (status, body) = send(
            &app,
            request(
                Method::POST,
                &answer_uri,
                Some(1),
                Some(json!({ "question_id": question_id, "selected_option_id": correct_option })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "conflict");

        // Someone else's session
        let (status, body) = send(
            &app,
            request(
                Method::POST,
                &answer_uri,
                Some(2),
                Some(json!({ "question_id": question_id, "text_answer": "Mint" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["message"], "unauthorized");

        let (status, listed) = send(&app, request(Method::GET, "/quizzes", Some(1), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["session"]["answered_questions"], 1);

        let status_uri = format!("/quizzes/{}/status", session_id);
        let (status, session) = send(
            &app,
            request(Method::PATCH, &status_uri, Some(1), Some(json!({ "status": "abandoned" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["status"], "abandoned");
        assert!(session["completed_at"].is_string());

        let quiz_uri = format!("/quizzes/{}", session_id);
        let (status, _) = send(&app, request(Method::DELETE, &quiz_uri, Some(1), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, request(Method::GET, &quiz_uri, Some(1), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "not_found");
    }

    #[tokio::test]
    async fn test_bad_bodies_are_validation_errors() {
        let (db, _temp) = setup_test_db();
        let app = app(db, Vec::new());

        let (status, body) = send(
            &app,
            request(Method::POST, "/quizzes", Some(1), Some(json!({ "episode": 1 }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "validation_error");

        let (status, body) = send(
            &app,
            request(Method::POST, "/quizzes", Some(1), Some(json!({ "episode_id": 0 }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "validation_error");

        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/quizzes/7/answers",
                Some(1),
                Some(json!({ "question_id": 1, "selected_option_id": 2, "text_answer": "x" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "validation_error");

        let (status, body) = send(&app, request(Method::GET, "/quizzes/abc", Some(1), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "validation_error");
    }

    #[tokio::test]
    async fn test_stream_rejects_bad_episode_ids() {
        let (db, _temp) = setup_test_db();
        let app = app(db, Vec::new());

        for uri in [
            "/transcripts/stream/sse",
            "/transcripts/stream/sse?episode_id=abc",
            "/transcripts/stream/sse?episode_id=-1",
        ] {
            let (status, body) = send(&app, request(Method::GET, uri, Some(1), None)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body["message"], "validation_error");
        }

        let (status, body) = send(
            &app,
            request(Method::GET, "/transcripts/stream/sse?episode_id=77", Some(1), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "not_found");
    }

    #[tokio::test]
    async fn test_stream_ingests_episode() {
        let (db, _temp) = setup_test_db();
        let episode_id = seed_episode(&db, Some("Alice hosts."));
        let app = app(
            db.clone(),
            vec![
                WordEvent::new("Hello", 0.0, 0.4, 0),
                WordEvent::new("there.", 0.4, 0.9, 0),
            ],
        );

        let uri = format!("/transcripts/stream/sse?episode_id={}", episode_id);
        let response = app
            .clone()
            .oneshot(request(Method::GET, &uri, Some(1), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let events: Vec<&str> = text
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| f.lines().next().unwrap())
            .collect();
        assert_eq!(
            events,
            vec![
                "event: speaker",
                "event: chunk",
                "event: chunk",
                "event: speaker",
                "event: complete"
            ]
        );
        assert!(text.contains("data: {\"index\":0,\"name\":\"Alice\"}"));

        let transcript = db.get_transcript_by_episode(episode_id).unwrap().unwrap();
        assert_eq!(
            transcript.status,
            crate::database::TranscriptStatus::Complete
        );
    }
}
