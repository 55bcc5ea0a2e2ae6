//! REST surface of the gateway: projects, tasks, plans, git views, workers,
//! dispatcher events, and the worker-to-engine status callback.
//!
//! Handlers never hold store locks across I/O — every store call snapshots
//! under its own short-lived file lock, and git history views run on the
//! blocking pool.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::errors::StoreError;
use crate::git::history;
use crate::models::{
    ProjectCreate, ProjectSettingsUpdate, ProjectStats, ProjectStatus, TaskCreate, TaskPatch,
    TaskStatus,
};
use crate::supervisor;

use super::AppState;

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Forbidden(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

// ── Request payloads ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct MergeRequest {
    #[serde(default)]
    pub squash: bool,
}

#[derive(Deserialize)]
pub struct PlanGenerateRequest {
    pub task_id: String,
}

#[derive(Deserialize)]
pub struct PlanApprovalRequest {
    pub task_id: String,
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub answers: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Deserialize)]
pub struct BatchPlanApprovalRequest {
    pub task_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct PlanChatRequest {
    pub task_id: String,
    pub message: String,
}

#[derive(Deserialize)]
pub struct InternalStatusUpdate {
    pub status: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize)]
pub struct LimitParam {
    pub limit: Option<usize>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/:pid", axum::routing::delete(delete_project))
        .route("/api/projects/:pid/retry", post(retry_project))
        .route("/api/projects/:pid/settings", patch(update_settings))
        .route("/api/local-repos", get(list_local_repos))
        .route(
            "/api/projects/:pid/tasks",
            get(list_tasks).post(create_task),
        )
        .route(
            "/api/projects/:pid/tasks/:tid",
            get(get_task).delete(delete_task),
        )
        .route("/api/projects/:pid/tasks/:tid/cancel", post(cancel_task))
        .route("/api/projects/:pid/tasks/:tid/retry", post(retry_task))
        .route("/api/projects/:pid/tasks/:tid/merge", post(merge_task))
        .route("/api/projects/:pid/plan/generate", post(plan_generate))
        .route("/api/projects/:pid/plan/approve", post(plan_approve))
        .route(
            "/api/projects/:pid/plan/batch-approve",
            post(plan_batch_approve),
        )
        .route("/api/projects/:pid/plan/chat", post(plan_chat))
        .route("/api/projects/:pid/git/log", get(git_log))
        .route("/api/projects/:pid/git/commit/:sha", get(git_commit))
        .route("/api/projects/:pid/git/unpushed", get(git_unpushed))
        .route("/api/projects/:pid/git/push", post(git_push))
        .route("/api/projects/:pid/stats", get(project_stats))
        .route("/api/workers", get(list_workers))
        .route("/api/workers/:wid/restart", post(restart_worker))
        .route("/api/dispatcher/events", get(dispatcher_events))
        .route(
            "/api/internal/tasks/:pid/:tid/status",
            post(internal_update_status),
        )
        .route("/api/internal/tasks/:pid/:tid", get(internal_get_task))
        .route("/health", get(health_check))
}

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Projects ──────────────────────────────────────────────────────────

async fn list_projects(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let projects = state.store.list_projects().await?;
    Ok(Json(projects).into_response())
}

async fn create_project(
    State(state): State<SharedState>,
    Json(body): Json<ProjectCreate>,
) -> Result<Response, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("project name is required".into()));
    }
    let project = state.store.create_project(body).await?;
    supervisor::spawn_project_setup(
        state.store.clone(),
        Arc::clone(&state.config),
        state.git.clone(),
        Arc::clone(&state.events),
        project.clone(),
    );
    Ok((StatusCode::CREATED, Json(project)).into_response())
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
) -> Result<Response, ApiError> {
    if state.store.delete_project(&pid).await? {
        Ok(Json(json!({"status": "deleted"})).into_response())
    } else {
        Err(ApiError::NotFound(format!("project {} not found", pid)))
    }
}

async fn retry_project(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
) -> Result<Response, ApiError> {
    let project = state.store.get_project(&pid).await?;
    if project.status != ProjectStatus::Error {
        return Err(ApiError::BadRequest(
            "project is not in error state".into(),
        ));
    }
    if project.origin.repo_url().is_none() {
        return Err(ApiError::BadRequest("project has no repo_url".into()));
    }

    // Drop the partial clone before trying again.
    let repo = state.config.repo_dir(&pid);
    let _ = tokio::fs::remove_dir_all(&repo).await;

    let project = state
        .store
        .update_project_status(&pid, ProjectStatus::Cloning, None)
        .await?;
    supervisor::spawn_project_setup(
        state.store.clone(),
        Arc::clone(&state.config),
        state.git.clone(),
        Arc::clone(&state.events),
        project,
    );
    Ok(Json(json!({"status": "retrying"})).into_response())
}

async fn update_settings(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
    Json(body): Json<ProjectSettingsUpdate>,
) -> Result<Response, ApiError> {
    let project = state.store.update_project_settings(&pid, body).await?;
    Ok(Json(project).into_response())
}

/// Discover candidate local clones under the configured root.
async fn list_local_repos(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let root = state.config.local_repos_root.clone();
    let git = state.git.clone();
    let mut results = Vec::new();

    let mut entries = match tokio::fs::read_dir(&root).await {
        Ok(entries) => entries,
        Err(_) => return Ok(Json(results).into_response()),
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.join(".git").is_dir() {
            continue;
        }
        let branch = git
            .current_branch(&path)
            .await
            .unwrap_or_else(|_| "main".to_string());
        results.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "path": path.to_string_lossy(),
            "branch": branch,
        }));
    }
    results.sort_by_key(|v| v["name"].as_str().unwrap_or_default().to_string());
    Ok(Json(results).into_response())
}

// ── Tasks ─────────────────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
) -> Result<Response, ApiError> {
    state.store.get_project(&pid).await?;
    let tasks = state.store.list_tasks(&pid).await?;
    Ok(Json(tasks).into_response())
}

async fn create_task(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
    Json(body): Json<TaskCreate>,
) -> Result<Response, ApiError> {
    if body.description.trim().is_empty() {
        return Err(ApiError::BadRequest("task description is required".into()));
    }
    let plan_mode = body.plan_mode;
    let task = state.store.create_task(&pid, body).await?;
    if plan_mode {
        // Park the task behind the plan gate before a worker can claim it.
        let task = state
            .store
            .update_task(&pid, &task.id, TaskPatch::status(TaskStatus::PlanPending))
            .await?;
        spawn_plan_generation(&state, &pid, &task.id);
        return Ok((StatusCode::CREATED, Json(task)).into_response());
    }
    Ok((StatusCode::CREATED, Json(task)).into_response())
}

fn spawn_plan_generation(state: &SharedState, pid: &str, tid: &str) {
    let state = Arc::clone(state);
    let pid = pid.to_string();
    let tid = tid.to_string();
    tokio::spawn(async move {
        if let Err(e) = state.plans.generate(&pid, &tid).await {
            eprintln!("[plan] generation for {} failed: {:#}", tid, e);
        }
    });
}

async fn get_task(
    State(state): State<SharedState>,
    Path((pid, tid)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let task = state.store.get_task(&pid, &tid).await?;
    Ok(Json(task).into_response())
}

async fn delete_task(
    State(state): State<SharedState>,
    Path((pid, tid)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if state.store.delete_task(&pid, &tid).await? {
        Ok(Json(json!({"status": "deleted"})).into_response())
    } else {
        Err(ApiError::NotFound(format!("task {} not found", tid)))
    }
}

async fn cancel_task(
    State(state): State<SharedState>,
    Path((pid, tid)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    state.scheduler.cancel_task(&pid, &tid).await?;
    Ok(Json(json!({"status": "cancelled", "task_id": tid})).into_response())
}

async fn retry_task(
    State(state): State<SharedState>,
    Path((pid, tid)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let task = state.scheduler.retry_task(&pid, &tid).await?;
    if task.plan_mode && !task.plan_approved {
        // The plan was never approved: regenerate it instead of running
        // straight to a worker.
        state
            .store
            .update_task(&pid, &tid, TaskPatch::status(TaskStatus::PlanPending))
            .await?;
        spawn_plan_generation(&state, &pid, &tid);
        return Ok(Json(json!({"status": "retrying_plan", "task_id": tid})).into_response());
    }
    Ok(Json(json!({"status": "retrying", "task_id": tid})).into_response())
}

async fn merge_task(
    State(state): State<SharedState>,
    Path((pid, tid)): Path<(String, String)>,
    Json(body): Json<MergeRequest>,
) -> Result<Response, ApiError> {
    let commit = state.scheduler.manual_merge(&pid, &tid, body.squash).await?;
    Ok(Json(json!({"status": "merged", "commit": commit})).into_response())
}

// ── Plans ─────────────────────────────────────────────────────────────

async fn plan_generate(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
    Json(body): Json<PlanGenerateRequest>,
) -> Result<Response, ApiError> {
    state.store.get_task(&pid, &body.task_id).await?;
    spawn_plan_generation(&state, &pid, &body.task_id);
    Ok(Json(json!({"task_id": body.task_id, "status": "generating"})).into_response())
}

async fn plan_approve(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
    Json(body): Json<PlanApprovalRequest>,
) -> Result<Response, ApiError> {
    state
        .plans
        .approve(&pid, &body.task_id, body.approved, body.answers, body.feedback)
        .await
        .map_err(|e| match e.downcast::<StoreError>() {
            Ok(store_err) => ApiError::from(store_err),
            Err(other) => ApiError::Internal(other.to_string()),
        })?;
    let status = if body.approved { "approved" } else { "rejected" };
    Ok(Json(json!({"status": status, "task_id": body.task_id})).into_response())
}

async fn plan_batch_approve(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
    Json(body): Json<BatchPlanApprovalRequest>,
) -> Result<Response, ApiError> {
    let results = state
        .plans
        .batch_approve(&pid, &body.task_ids, body.approved, body.feedback)
        .await;
    let results: Vec<_> = results
        .into_iter()
        .map(|(task_id, outcome)| json!({"task_id": task_id, "status": outcome}))
        .collect();
    Ok(Json(json!({"results": results})).into_response())
}

async fn plan_chat(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
    Json(body): Json<PlanChatRequest>,
) -> Result<Response, ApiError> {
    state.store.get_task(&pid, &body.task_id).await?;
    let state_clone = Arc::clone(&state);
    let tid = body.task_id.clone();
    tokio::spawn(async move {
        if let Err(e) = state_clone.plans.chat(&pid, &tid, &body.message).await {
            eprintln!("[plan] chat for {} failed: {:#}", tid, e);
        }
    });
    Ok(Json(json!({"status": "streaming", "task_id": body.task_id})).into_response())
}

// ── Git views ─────────────────────────────────────────────────────────

async fn git_log(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
    Query(params): Query<LimitParam>,
) -> Result<Response, ApiError> {
    state.store.get_project(&pid).await?;
    let repo = state.config.repo_dir(&pid);
    let limit = params.limit.unwrap_or(50);
    let commits = tokio::task::spawn_blocking(move || history::log(&repo, limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .unwrap_or_default();
    Ok(Json(json!({"commits": commits})).into_response())
}

async fn git_commit(
    State(state): State<SharedState>,
    Path((pid, sha)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    state.store.get_project(&pid).await?;
    if !history::is_valid_sha(&sha) {
        return Err(ApiError::BadRequest(format!("invalid commit id: {}", sha)));
    }
    let repo = state.config.repo_dir(&pid);
    let detail = tokio::task::spawn_blocking(move || history::commit_detail(&repo, &sha))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(|e| ApiError::NotFound(e.to_string()))?;
    Ok(Json(detail).into_response())
}

async fn git_unpushed(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
) -> Result<Response, ApiError> {
    let project = state.store.get_project(&pid).await?;
    let repo = state.config.repo_dir(&pid);
    let branch = project.branch.clone();
    let (count, has_remote) =
        tokio::task::spawn_blocking(move || history::unpushed_count(&repo, &branch))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .unwrap_or((0, false));
    Ok(Json(json!({"count": count, "has_remote": has_remote})).into_response())
}

async fn git_push(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
) -> Result<Response, ApiError> {
    let project = state.store.get_project(&pid).await?;
    let repo = state.config.repo_dir(&pid);
    let _lock = state.scheduler.lock_project(&pid).await;
    state
        .git
        .push(&repo, "origin", &project.branch)
        .await
        .map_err(|e| ApiError::Internal(e.excerpt()))?;
    Ok(Json(json!({"status": "pushed", "branch": project.branch})).into_response())
}

// ── Workers, events, stats ────────────────────────────────────────────

async fn list_workers(State(state): State<SharedState>) -> Result<Response, ApiError> {
    Ok(Json(state.scheduler.workers()).into_response())
}

async fn restart_worker(
    State(state): State<SharedState>,
    Path(wid): Path<String>,
) -> Result<Response, ApiError> {
    if state.scheduler.stop_worker(&wid).await {
        Ok(Json(json!({"status": "stopped"})).into_response())
    } else {
        Err(ApiError::NotFound(format!(
            "worker {} not found or not running",
            wid
        )))
    }
}

async fn dispatcher_events(
    State(state): State<SharedState>,
    Query(params): Query<LimitParam>,
) -> Result<Response, ApiError> {
    let limit = params.limit.unwrap_or(50);
    Ok(Json(state.events.recent(limit)).into_response())
}

async fn project_stats(
    State(state): State<SharedState>,
    Path(pid): Path<String>,
) -> Result<Response, ApiError> {
    state.store.get_project(&pid).await?;
    let tasks = state.store.list_tasks(&pid).await?;
    Ok(Json(ProjectStats::compute(&tasks)).into_response())
}

// ── Internal callback (worker containers only) ────────────────────────

/// Accept loopback and private-range peers: worker containers reach the
/// gateway through the Docker bridge network.
fn peer_is_trusted(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

async fn internal_update_status(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((pid, tid)): Path<(String, String)>,
    Json(body): Json<InternalStatusUpdate>,
) -> Result<Response, ApiError> {
    if !peer_is_trusted(peer.ip()) {
        return Err(ApiError::Forbidden("callback not allowed from this address".into()));
    }
    let status: TaskStatus = body
        .status
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;

    let patch = TaskPatch {
        status: Some(status),
        branch: body.branch.map(Some),
        commit_id: body.commit.map(Some),
        error: body.error.map(Some),
        ..Default::default()
    };
    // Transition validation makes repeated callbacks idempotent and rejects
    // stale ones (a late `merging` after the task already failed is a 409,
    // mutating nothing).
    state.store.update_task(&pid, &tid, patch).await?;
    Ok(Json(json!({"status": "updated", "task_id": tid})).into_response())
}

async fn internal_get_task(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((pid, tid)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if !peer_is_trusted(peer.ip()) {
        return Err(ApiError::Forbidden("callback not allowed from this address".into()));
    }
    let task = state.store.get_task(&pid, &tid).await?;
    Ok(Json(task).into_response())
}
