use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::database::Conflict;
use crate::llm::LlmError;
use crate::transcription::SttError;

/// Typed application error hierarchy for every HTTP handler and core call.
///
/// Each variant carries a human-readable detail string. The wire contract is
/// the pair returned by [`AppError::kind`] and [`AppError::status_code`]; the
/// detail only ever lands in the `details` field of the JSON body.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// No authenticated identity on the request.
    #[error("{0}")]
    Unauthenticated(String),

    /// Authenticated, but the resource belongs to somebody else.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Database(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Contract string reported in the `message` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Unauthenticated(_) | Self::Forbidden(_) => "unauthorized",
            Self::Conflict(_) => "conflict",
            Self::Upstream(_) => "upstream_error",
            Self::Database(_) => "database_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Conflict(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Upstream(_) | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: &'static str,
    details: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("{} ({}): {}", status, self.kind(), self);
        } else {
            log::debug!("{} ({}): {}", status, self.kind(), self);
        }

        let body = ErrorBody {
            message: self.kind(),
            details: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

/// The store layer speaks `anyhow`; anything that reaches a handler unmatched
/// is a database failure.
impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(format!("{:#}", e))
    }
}

impl From<Conflict> for AppError {
    fn from(conflict: Conflict) -> Self {
        AppError::Conflict(conflict.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<LlmError> for AppError {
    fn from(e: LlmError) -> Self {
        AppError::Upstream(e.to_string())
    }
}

impl From<SttError> for AppError {
    fn from(e: SttError) -> Self {
        AppError::Upstream(e.to_string())
    }
}

/// Allows `ok_or_else(|| format!(…))?` to coerce into AppError.
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Internal(s)
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_status_codes() {
        let cases = [
            (AppError::Validation("x".into()), "validation_error", 400),
            (AppError::NotFound("x".into()), "not_found", 404),
            (AppError::Unauthenticated("x".into()), "unauthorized", 401),
            (AppError::Forbidden("x".into()), "unauthorized", 403),
            (AppError::Conflict("x".into()), "conflict", 400),
            (AppError::Upstream("x".into()), "upstream_error", 500),
            (AppError::Database("x".into()), "database_error", 500),
            (AppError::Internal("x".into()), "internal_error", 500),
        ];

        for (err, kind, status) in cases {
            assert_eq!(err.kind(), kind);
            assert_eq!(err.status_code().as_u16(), status);
        }
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = AppError::NotFound("session 7".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], "not_found");
        assert_eq!(body["details"], "Not found: session 7");
    }

    #[test]
    fn test_anyhow_maps_to_database_error() {
        let err: AppError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.kind(), "database_error");
    }
}
