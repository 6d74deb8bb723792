//! Handlers for `/api/cases` and `/api/dashboard`.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/api/cases` | Optional `?estado=RECIBIDO&limit=100` |
//! | `POST` | `/api/cases` | Body: [`NewCase`] |
//! | `GET`  | `/api/cases/{id}` | [`CaseDetail`]; 404 if not found |
//! | `GET`  | `/api/cases/{id}/activities` | Oldest first |
//! | `POST` | `/api/cases/{id}/assign` | Body: `{"responsableId": "..."}` |
//! | `POST` | `/api/cases/{id}/start-drafting` | |
//! | `POST` | `/api/cases/{id}/submit-review` | |
//! | `POST` | `/api/cases/{id}/approve-review` | |
//! | `POST` | `/api/cases/{id}/approve` | |
//! | `POST` | `/api/cases/{id}/send-final` | |
//! | `POST` | `/api/cases/{id}/close` | |
//! | `GET`  | `/api/dashboard` | |

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::machine::{CaseEvent, available_events};
use super::model::{Activity, Case, CaseState, DashboardSummary};
use super::workflow::NewCase;
use crate::api::{ActingUser, ApiError, AppState, parse_id, with_message};

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 500;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/cases", get(list).post(create))
        .route("/api/cases/{id}", get(get_one))
        .route("/api/cases/{id}/activities", get(activities))
        .route("/api/cases/{id}/assign", post(assign))
        .route("/api/cases/{id}/start-drafting", post(start_drafting))
        .route("/api/cases/{id}/submit-review", post(submit_review))
        .route("/api/cases/{id}/approve-review", post(approve_review))
        .route("/api/cases/{id}/approve", post(approve))
        .route("/api/cases/{id}/send-final", post(send_final))
        .route("/api/cases/{id}/close", post(close))
        .route("/api/dashboard", get(dashboard))
}

// ── Reads ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub estado: Option<CaseState>,
    pub limit: Option<usize>,
}

async fn list(
    State(state): State<AppState>,
    _user: ActingUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Case>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.workflow.list_cases(params.estado, limit).await?))
}

/// A case with its overdue flag and the events its state allows next.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseDetail {
    #[serde(flatten)]
    pub case: Case,
    pub vencido: bool,
    pub acciones_disponibles: Vec<CaseEvent>,
}

impl CaseDetail {
    fn new(case: Case) -> Self {
        Self {
            vencido: case.is_overdue(Utc::now()),
            acciones_disponibles: available_events(case.estado),
            case,
        }
    }
}

async fn get_one(
    State(state): State<AppState>,
    _user: ActingUser,
    Path(id): Path<String>,
) -> Result<Json<CaseDetail>, ApiError> {
    let id = parse_id(&id, "caso")?;
    Ok(Json(CaseDetail::new(state.workflow.get_case(id).await?)))
}

async fn activities(
    State(state): State<AppState>,
    _user: ActingUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<Activity>>, ApiError> {
    let id = parse_id(&id, "caso")?;
    Ok(Json(state.workflow.list_activities(id).await?))
}

async fn dashboard(
    State(state): State<AppState>,
    _user: ActingUser,
) -> Result<Json<DashboardSummary>, ApiError> {
    Ok(Json(state.workflow.dashboard().await?))
}

// ── Intake ──────────────────────────────────────────────────────────

async fn create(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    body: Result<Json<NewCase>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(input) = body?;
    let case = state.workflow.create_case(user_id, input).await?;
    Ok((StatusCode::CREATED, with_message("Caso creado", case)?))
}

// ── Transitions ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBody {
    pub responsable_id: Uuid,
}

async fn assign(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Path(id): Path<String>,
    body: Result<Json<AssignBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id, "caso")?;
    let Json(body) = body?;
    let case = state.workflow.assign(id, user_id, body.responsable_id).await?;
    with_message("Caso asignado", case)
}

async fn start_drafting(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id, "caso")?;
    let case = state.workflow.start_drafting(id, user_id).await?;
    with_message("Redacción iniciada", case)
}

async fn submit_review(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id, "caso")?;
    let (case, review_id) = state.workflow.submit_for_legal_review(id, user_id).await?;
    with_message(
        "Caso enviado a revisión jurídica",
        json!({ "case": case, "revisionId": review_id }),
    )
}

async fn approve_review(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id, "caso")?;
    let (case, approval_id) = state.workflow.approve_review(id, user_id).await?;
    with_message(
        "Revisión aprobada; caso enviado a aprobación",
        json!({ "case": case, "aprobacionId": approval_id }),
    )
}

async fn approve(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id, "caso")?;
    let case = state.workflow.approve(id, user_id).await?;
    with_message("Caso aprobado", case)
}

async fn send_final(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id, "caso")?;
    let case = state.workflow.send_final(id, user_id).await?;
    with_message("Respuesta enviada", case)
}

async fn close(
    State(state): State<AppState>,
    ActingUser(user_id): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id, "caso")?;
    let case = state.workflow.close_case(id, user_id).await?;
    with_message("Caso cerrado", case)
}
