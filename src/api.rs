//! HTTP surface: shared state, error mapping, acting-user extractor, router.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, rejection::JsonRejection},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::cases::CaseWorkflow;
use crate::error::{Error, WorkflowError};
use crate::mail::MailSync;
use crate::store::Database;

/// Header carrying the acting user's ID, set by the session provider.
pub const ACTING_USER_HEADER: &str = "x-user-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub workflow: CaseWorkflow,
    pub db: Arc<dyn Database>,
    /// `None` when Gmail is not configured.
    pub sync: Option<Arc<MailSync>>,
}

/// Build the full API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(crate::cases::routes::routes())
        .merge(crate::mail::routes::routes())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "llanogas"
    }))
}

// ── Errors ──────────────────────────────────────────────────────────

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(m) => {
                error!(error = %m, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::InvalidState { .. } | WorkflowError::Validation(_) => {
                Self::BadRequest(e.to_string())
            }
            WorkflowError::NotFound(m) => Self::NotFound(m),
            WorkflowError::Forbidden(m) => Self::Forbidden(m),
            WorkflowError::Conflict(m) => Self::Conflict(m),
            WorkflowError::Internal(m) => Self::Internal(m),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Mailbox(m) => Self::Unavailable(m.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}

/// Parse a path ID, rejecting malformed UUIDs with 400.
pub fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("ID de {what} inválido")))
}

/// `{"message": ..., <fields of value>}`. Non-object values land under
/// `data`.
pub fn with_message(message: &str, value: impl Serialize) -> Result<Json<Value>, ApiError> {
    let value = serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut body = match value {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".into(), other);
            map
        }
    };
    body.insert("message".into(), Value::String(message.to_string()));
    Ok(Json(Value::Object(body)))
}

// ── Acting user ─────────────────────────────────────────────────────

/// The user on whose behalf the request runs, from [`ACTING_USER_HEADER`].
///
/// Only presence and shape are checked here; the workflow rejects unknown or
/// inactive users.
#[derive(Debug, Clone, Copy)]
pub struct ActingUser(pub Uuid);

impl<S> FromRequestParts<S> for ActingUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(ACTING_USER_HEADER)
            .ok_or_else(|| ApiError::Unauthorized(format!("Falta el encabezado {ACTING_USER_HEADER}")))?;
        let id = raw
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .ok_or_else(|| ApiError::Unauthorized(format!("Encabezado {ACTING_USER_HEADER} inválido")))?;
        Ok(Self(id))
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;
    use crate::cases::model::CaseState;

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn invalid_state_is_bad_request() {
        let err: ApiError = WorkflowError::InvalidState {
            case_id: Uuid::nil(),
            current: CaseState::Recibido,
            required: CaseState::EnRedaccion,
        }
        .into();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("requiere EN_REDACCION"));
    }

    #[tokio::test]
    async fn malformed_id_is_bad_request_in_spanish() {
        let err = parse_id("no-es-uuid", "caso").unwrap_err();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "ID de caso inválido");
    }

    #[test]
    fn workflow_errors_map_to_statuses() {
        let cases = [
            (WorkflowError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (WorkflowError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (WorkflowError::Conflict("x".into()), StatusCode::CONFLICT),
            (WorkflowError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (WorkflowError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn mailbox_failure_is_unavailable() {
        let err: ApiError = Error::Mailbox(crate::error::MailboxError::RateLimited).into();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn with_message_flattens_objects() {
        let Json(body) = with_message("ok", json!({"id": 1})).unwrap();
        assert_eq!(body["message"], "ok");
        assert_eq!(body["id"], 1);

        let Json(body) = with_message("ok", vec![1, 2]).unwrap();
        assert_eq!(body["data"], json!([1, 2]));
    }
}
