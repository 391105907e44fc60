use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::bridge::SessionBridge;
use super::deploy::{DeployRequest, DeploymentTrigger};
use super::hub::RelayHub;
use super::identity::{IdentityValidator, bearer_token};
use super::models::{Identity, Job, JobUpdate, NewJob, NewSnapshot, SnapshotKind};
use super::orchestrator::Orchestrator;
use super::publisher::slugify;
use super::store::JobStore;
use crate::errors::StoreError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub store: Arc<dyn JobStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub bridge: Arc<SessionBridge>,
    pub identity: Arc<dyn IdentityValidator>,
    pub deployer: Option<Arc<dyn DeploymentTrigger>>,
}

pub type SharedState = Arc<AppState>;

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub instruction: String,
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct CreateSnapshotRequest {
    pub iteration: Option<i64>,
    pub file_state: serde_json::Value,
    pub instruction: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
pub struct DeployJobRequest {
    pub name: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
    NotImplemented(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::NotImplemented(msg) => (StatusCode::NOT_IMPLEMENTED, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast_ref::<StoreError>() {
            Some(StoreError::JobNotFound { .. }) => ApiError::NotFound(e.to_string()),
            Some(StoreError::InvalidTransition { .. } | StoreError::SnapshotOutOfOrder { .. }) => {
                ApiError::Conflict(e.to_string())
            }
            None => {
                tracing::error!(error = %e, "Request failed");
                ApiError::Internal(e.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route(
            "/api/jobs/{id}/snapshots",
            get(list_snapshots).post(create_snapshot),
        )
        .route(
            "/api/jobs/{id}/snapshots/{iteration}",
            get(get_snapshot).delete(delete_snapshot),
        )
        .route("/api/jobs/{id}/deploy", post(deploy_job))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    state
        .identity
        .validate(token)
        .await
        .ok_or_else(|| ApiError::Unauthorized("Invalid token".into()))
}

/// Load a job the caller owns: 404 if missing, 403 if someone else's.
async fn owned_job(state: &AppState, identity: &Identity, id: i64) -> Result<Job, ApiError> {
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))?;
    if job.owner_id != identity.id {
        return Err(ApiError::Forbidden(format!("Job {} belongs to another user", id)));
    }
    Ok(job)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_job(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    if req.instruction.trim().is_empty() {
        return Err(ApiError::BadRequest("Instruction must not be empty".into()));
    }
    let session_id = req.session_id.clone();
    let job = state
        .orchestrator
        .submit(NewJob {
            owner_id: identity.id,
            instruction: req.instruction,
            session_id: req.session_id,
        })
        .await?;
    if let Some(session_id) = session_id {
        state.bridge.bind_session(&session_id, job.id);
    }
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn list_jobs(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let jobs = state.store.list_jobs_for_owner(&identity.id, limit).await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    Ok(Json(owned_job(&state, &identity, id).await?))
}

async fn list_snapshots(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    owned_job(&state, &identity, id).await?;
    Ok(Json(state.store.list_snapshots_for_job(id).await?))
}

async fn create_snapshot(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<CreateSnapshotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    owned_job(&state, &identity, id).await?;

    let iteration = match req.iteration {
        Some(iteration) => iteration,
        None => {
            let existing = state.store.list_snapshots_for_job(id).await?;
            existing.last().map(|s| s.iteration + 1).unwrap_or(1)
        }
    };
    let snapshot = state
        .store
        .create_snapshot(NewSnapshot {
            job_id: id,
            iteration,
            kind: SnapshotKind::Manual,
            file_state: req.file_state,
            instruction: req.instruction,
            metadata: req.metadata.unwrap_or(serde_json::Value::Null),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_snapshot(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, iteration)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    owned_job(&state, &identity, id).await?;
    match state.store.get_snapshot(id, iteration).await? {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(ApiError::NotFound(format!(
            "Snapshot {} for job {} not found",
            iteration, id
        ))),
    }
}

async fn delete_snapshot(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((id, iteration)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    owned_job(&state, &identity, id).await?;
    let not_found = || ApiError::NotFound(format!("Snapshot {} for job {} not found", iteration, id));
    let snapshot = state
        .store
        .get_snapshot(id, iteration)
        .await?
        .ok_or_else(not_found)?;
    if !state.store.delete_snapshot(snapshot.id).await? {
        return Err(not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn deploy_job(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    body: Option<Json<DeployJobRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let job = owned_job(&state, &identity, id).await?;
    let output_location = job
        .output_location
        .clone()
        .ok_or_else(|| ApiError::Conflict(format!("Job {} has no output to deploy", id)))?;
    let deployer = state
        .deployer
        .as_ref()
        .ok_or_else(|| ApiError::NotImplemented("No deployment trigger configured".into()))?;

    let name = body
        .and_then(|Json(req)| req.name)
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| {
            let slug = slugify(&job.instruction, 40);
            if slug.is_empty() {
                format!("genforge-{}", id)
            } else {
                slug
            }
        });

    let url = deployer
        .deploy(&DeployRequest {
            job_id: id,
            name,
            output_location,
        })
        .await
        .map_err(|e| ApiError::Internal(format!("Deployment failed: {:#}", e)))?;

    let job = state
        .store
        .update_job(
            id,
            JobUpdate {
                deployment_url: Some(url),
                ..Default::default()
            },
        )
        .await?;
    Ok(Json(job))
}

// ── Tests ─────────────────────────────────────────────────────────────
