use std::sync::{Arc, RwLock};

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::collect::{RunCoordinator, RunError};
use crate::config::{self, AppConfig};
use crate::progress::ProgressSnapshot;
use crate::state::{StateError, StateManager};
use crate::store::{self, FeedbackRecord, FeedbackStore};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RunCoordinator>,
    pub store: Arc<dyn FeedbackStore>,
    pub state_manager: Arc<StateManager>,
    pub config: Arc<AppConfig>,
    pub keywords: Arc<RwLock<Vec<String>>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/collect", post(start_collection))
        .route("/api/collection_status", get(collection_status))
        .route("/api/progress", get(progress_snapshot))
        .route("/api/runs/{id}", get(run_status))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/feedback", get(list_feedback))
        .route("/api/feedback/{identity}/state", post(update_state))
        .route("/api/feedback/{identity}/comments", post(add_comment))
        .route("/api/feedback/{identity}/history", get(get_history))
        .route("/api/export.csv", get(export_csv))
        .route("/api/keywords", get(get_keywords).post(set_keywords))
        .route("/api/keywords/restore_default", post(restore_default_keywords))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn err(status: StatusCode, message: impl ToString) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

fn run_error(e: RunError) -> ApiError {
    let status = match &e {
        RunError::AlreadyActive(_) => StatusCode::CONFLICT,
        RunError::NoSourcesEnabled => StatusCode::BAD_REQUEST,
        RunError::UnknownRun(_) => StatusCode::NOT_FOUND,
    };
    err(status, e)
}

fn state_error(e: StateError) -> ApiError {
    let status = match &e {
        StateError::UnknownIdentity(_) => StatusCode::NOT_FOUND,
        StateError::InvalidState(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    err(status, e)
}

async fn start_collection(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let sources = state.config.enabled_sources();
    let run_id = Arc::clone(&state.coordinator)
        .start_run(sources)
        .map_err(run_error)?;
    Ok(Json(json!({ "run_id": run_id })))
}

async fn collection_status(State(state): State<AppState>) -> Json<Value> {
    match state.coordinator.current() {
        Some(run) => Json(json!(run)),
        None => Json(json!({ "status": "ready" })),
    }
}

async fn progress_snapshot(State(state): State<AppState>) -> Json<ProgressSnapshot> {
    Json(state.coordinator.progress().snapshot())
}

async fn run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .coordinator
        .get_status(&id)
        .map(|run| Json(json!(run)))
        .ok_or_else(|| run_error(RunError::UnknownRun(id)))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.coordinator.cancel_run(&id).map_err(run_error)?;
    Ok(Json(json!({ "run_id": id, "cancelled": true })))
}

async fn list_feedback(State(state): State<AppState>) -> Json<Vec<FeedbackRecord>> {
    Json(state.store.list())
}

#[derive(serde::Deserialize)]
struct StateUpdateReq {
    state: String,
    user: String,
}

async fn update_state(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Json(body): Json<StateUpdateReq>,
) -> Result<Json<FeedbackRecord>, ApiError> {
    state
        .state_manager
        .update_state(&identity, &body.state, &body.user)
        .map(Json)
        .map_err(state_error)
}

#[derive(serde::Deserialize)]
struct CommentReq {
    text: String,
    user: String,
}

async fn add_comment(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Json(body): Json<CommentReq>,
) -> Result<Json<crate::state::Comment>, ApiError> {
    state
        .state_manager
        .add_comment(&identity, &body.text, &body.user)
        .map(Json)
        .map_err(state_error)
}

async fn get_history(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<Vec<crate::state::StateTransition>>, ApiError> {
    state
        .state_manager
        .get_history(&identity)
        .map(Json)
        .map_err(state_error)
}

async fn export_csv(
    State(state): State<AppState>,
) -> Result<([(header::HeaderName, &'static str); 1], String), ApiError> {
    let records = state.store.list();
    let mut buf = Vec::new();
    store::export_csv(&records, &mut buf)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("export failed: {e:#}")))?;
    let body = String::from_utf8(buf)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("export not utf-8: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "text/csv")], body))
}

async fn get_keywords(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.keywords.read().expect("keywords lock poisoned").clone())
}

#[derive(serde::Deserialize)]
struct KeywordsReq {
    keywords: Vec<String>,
}

async fn set_keywords(
    State(state): State<AppState>,
    Json(body): Json<KeywordsReq>,
) -> Result<Json<Value>, ApiError> {
    let cleaned: Vec<String> = body
        .keywords
        .iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    config::save_keywords(&cleaned)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("saving keywords: {e:#}")))?;
    *state.keywords.write().expect("keywords lock poisoned") = cleaned.clone();
    Ok(Json(json!({ "status": "success", "keywords": cleaned })))
}

async fn restore_default_keywords(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let defaults = config::default_keywords();
    config::save_keywords(&defaults)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, format!("saving keywords: {e:#}")))?;
    *state.keywords.write().expect("keywords lock poisoned") = defaults.clone();
    Ok(Json(json!({ "status": "success", "keywords": defaults })))
}
