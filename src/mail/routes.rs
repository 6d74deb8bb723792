//! Handlers for `/api/emails`.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/api/emails` | Optional `?unlinked=true&limit=100` |
//! | `GET`  | `/api/emails/{id}` | 404 if not found |
//! | `POST` | `/api/emails/{id}/create-case` | 409 if already linked |
//! | `POST` | `/api/emails/sync` | 503 when Gmail is not configured |
//! | `GET`  | `/api/emails/sync/status` | |

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::model::Email;
use super::sync::{MailSync, SyncOutcome, SyncStatus};
use crate::api::{ActingUser, ApiError, AppState, parse_id, with_message};

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 500;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/emails", get(list))
        .route("/api/emails/sync", post(trigger_sync))
        .route("/api/emails/sync/status", get(sync_status))
        .route("/api/emails/{id}", get(get_one))
        .route("/api/emails/{id}/create-case", post(create_case))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub unlinked: bool,
    pub limit: Option<usize>,
}

async fn list(
    State(state): State<AppState>,
    _user: ActingUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Email>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let emails = state
        .db
        .list_emails(params.unlinked, limit)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(emails))
}

async fn get_one(
    State(state): State<AppState>,
    _user: ActingUser,
    Path(id): Path<String>,
) -> Result<Json<Email>, ApiError> {
    let id = parse_id(&id, "correo")?;
    state
        .db
        .get_email(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Correo {id} no encontrado")))
}

async fn create_case(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "correo")?;
    let case = state.workflow.create_case_from_email(id, user_id).await?;
    Ok((StatusCode::CREATED, with_message("Caso creado desde el correo", case)?))
}

fn sync_service(state: &AppState) -> Result<Arc<MailSync>, ApiError> {
    state
        .sync
        .clone()
        .ok_or_else(|| ApiError::Unavailable("La sincronización de correo no está configurada".into()))
}

async fn trigger_sync(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
) -> Result<Json<Value>, ApiError> {
    let sync = sync_service(&state)?;
    info!(user_id = %user_id, "Manual mail sync requested");
    match sync.run_once().await? {
        SyncOutcome::Completed(report) => with_message("Sincronización completada", report),
        SyncOutcome::AlreadyRunning => Ok(Json(json!({
            "message": "Ya hay una sincronización en curso",
            "skipped": true
        }))),
    }
}

async fn sync_status(
    State(state): State<AppState>,
    _user: ActingUser,
) -> Result<Json<SyncStatus>, ApiError> {
    let sync = sync_service(&state)?;
    Ok(Json(sync.status().await))
}
