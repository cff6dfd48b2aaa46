use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::auth::AuthUser;
use crate::error::AppError;
use crate::sse::{sse_response, SseEmitter};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub episode_id: Option<String>,
}

fn parse_episode_id(query: Result<Query<StreamQuery>, QueryRejection>) -> Result<i64, AppError> {
    let Query(query) = query.map_err(|e| AppError::Validation(e.body_text()))?;
    let raw = query
        .episode_id
        .ok_or_else(|| AppError::Validation("episode_id is required".to_string()))?;
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            AppError::Validation(format!("episode_id must be a positive integer, got {:?}", raw))
        })
}

/// `GET /transcripts/stream/sse?episode_id=<id>`
///
/// Errors found before streaming starts (bad id, unknown episode) are plain
/// JSON errors; anything later arrives as an `error` event.
pub async fn stream_transcript(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let episode_id = parse_episode_id(query)?;
    let plan = state.pipeline.prepare(episode_id)?;
    log::info!(
        "User {} opened transcript stream for episode {} ({})",
        user_id,
        episode_id,
        match plan {
            crate::pipeline::StreamPlan::Replay { .. } => "replay",
            crate::pipeline::StreamPlan::Ingest { .. } => "ingest",
        }
    );

    let (emitter, stream) = SseEmitter::channel();
    let cancel = CancellationToken::new();

    // Cancel the upstream read once the client stops listening
    let watcher = emitter.clone();
    let watcher_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watcher.closed() => {
                log::info!("Client disconnected from transcript stream");
                watcher_cancel.cancel();
            }
            _ = watcher_cancel.cancelled() => {}
        }
    });

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let _ = pipeline.run(plan, emitter, cancel.clone()).await;
        // Releases the watcher's emitter so the body can end
        cancel.cancel();
    });

    Ok(sse_response(stream))
}
