use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::AppError;

/// Header carrying the user id, set by the authentication layer in front of
/// this service once the bearer token has been verified.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub i64);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthenticated("missing user identity".to_string()))?;

        raw.to_str()
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(AuthUser)
            .ok_or_else(|| AppError::Unauthenticated("invalid user identity".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<AuthUser, AppError> {
        let mut builder = Request::builder().uri("/quizzes");
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        AuthUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_extracts_user_id() {
        assert_eq!(extract(Some("42")).await.unwrap(), AuthUser(42));
    }

    #[tokio::test]
    async fn test_rejects_missing_or_bad_ids() {
        for header in [None, Some("abc"), Some("0"), Some("-3")] {
            let err = extract(header).await.unwrap_err();
            assert_eq!(err.kind(), "unauthorized");
            assert_eq!(err.status_code().as_u16(), 401);
        }
    }
}
