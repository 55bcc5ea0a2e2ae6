//! The HTTP/WebSocket gateway: REST for the UI, WebSockets for live log and
//! plan streams, and the loopback-only worker callback.

pub mod api;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::events::EventBus;
use crate::git::Git;
use crate::plan::PlanService;
use crate::scheduler::Scheduler;
use crate::store::Store;

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub events: Arc<EventBus>,
    pub scheduler: Scheduler,
    pub plans: PlanService,
    pub git: Git,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let dev_mode = state.config.dev_mode;
    let mut router = api::api_router()
        .route("/ws/logs/:wid", get(ws::ws_logs))
        .route("/ws/plan/:pid/:tid", get(ws::ws_plan))
        .with_state(state);
    if dev_mode {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Bind and serve until `shutdown` resolves. `on_listening` fires after the
/// listener is bound, before the first request — startup work that must wait
/// for a live gateway (stale-task recovery) hooks in there.
pub async fn serve(
    state: Arc<AppState>,
    on_listening: impl FnOnce(SocketAddr),
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let host = if state.config.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    eprintln!("[gateway] listening at http://{}", local_addr);
    on_listening(local_addr);

    let router = build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Gateway server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::models::{ProjectStatus, TaskStatus};
    use crate::runtime::MockRuntime;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct TestApp {
        _data: tempfile::TempDir,
        router: Router,
        state: Arc<AppState>,
    }

    fn test_app() -> TestApp {
        let data = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            data_dir: data.path().to_path_buf(),
            worker_count: 1,
            ..Config::default()
        });
        let events = Arc::new(EventBus::new());
        let store = Store::new(Arc::clone(&config), Arc::clone(&events));
        let agent = Arc::new(MockAgent::new());
        let runtime = Arc::new(MockRuntime::new());
        let scheduler = Scheduler::new(
            Arc::clone(&config),
            store.clone(),
            Arc::clone(&events),
            runtime,
            Arc::clone(&agent) as Arc<dyn crate::agent::Agent>,
        );
        let plans = PlanService::new(
            store.clone(),
            agent as Arc<dyn crate::agent::Agent>,
            Arc::clone(&events),
            Arc::clone(&config),
        );
        let state = Arc::new(AppState {
            config,
            store,
            events,
            scheduler,
            plans,
            git: Git::new(),
        });
        let router = build_router(Arc::clone(&state))
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999))));
        TestApp {
            _data: data,
            router,
            state,
        }
    }

    async fn request(
        app: &TestApp,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    async fn ready_project(app: &TestApp) -> String {
        let (status, project) = request(
            app,
            "POST",
            "/api/projects",
            Some(serde_json::json!({"name": "demo", "source_type": "new"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(project["status"], "cloning");
        let pid = project["id"].as_str().unwrap().to_string();
        // Wait for the background repository setup to finish.
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            let project = app.state.store.get_project(&pid).await.unwrap();
            if project.status == ProjectStatus::Ready {
                return pid;
            }
            assert_ne!(project.status, ProjectStatus::Error, "{:?}", project.error);
        }
        panic!("project setup never became ready");
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let (status, body) = request(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_project_crud_roundtrip() {
        let app = test_app();
        let pid = ready_project(&app).await;

        let (status, projects) = request(&app, "GET", "/api/projects", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(projects.as_array().unwrap().len(), 1);
        assert_eq!(projects[0]["id"], pid.as_str());
        assert_eq!(projects[0]["source_type"], "new");

        let (status, _) = request(
            &app,
            "PATCH",
            &format!("/api/projects/{}/settings", pid),
            Some(serde_json::json!({"auto_merge": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            request(&app, "DELETE", &format!("/api/projects/{}", pid), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "deleted");

        let (status, _) =
            request(&app, "DELETE", &format!("/api/projects/{}", pid), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_project_requires_name() {
        let app = test_app();
        let (status, body) = request(
            &app,
            "POST",
            "/api/projects",
            Some(serde_json::json!({"name": "  ", "source_type": "new"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("name"));
    }

    #[tokio::test]
    async fn test_task_create_and_list() {
        let app = test_app();
        let pid = ready_project(&app).await;

        let (status, task) = request(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks", pid),
            Some(serde_json::json!({"description": "add README section explaining install"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["id"], "t-000001");
        assert_eq!(task["status"], "pending");
        assert_eq!(task["title"], "add README section explaining install");

        let (status, tasks) =
            request(&app, "GET", &format!("/api/projects/{}/tasks", pid), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tasks.as_array().unwrap().len(), 1);

        let (status, single) = request(
            &app,
            "GET",
            &format!("/api/projects/{}/tasks/t-000001", pid),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(single["id"], "t-000001");

        let (status, _) = request(
            &app,
            "GET",
            &format!("/api/projects/{}/tasks/t-999999", pid),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_then_retry_task() {
        let app = test_app();
        let pid = ready_project(&app).await;
        request(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks", pid),
            Some(serde_json::json!({"description": "cancellable"})),
        )
        .await;

        let (status, body) = request(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks/t-000001/cancel", pid),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");

        let (status, body) = request(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks/t-000001/retry", pid),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "retrying");

        let task = app.state.store.get_task(&pid, "t-000001").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.worker_id, None);
        assert_eq!(task.error, None);
    }

    #[tokio::test]
    async fn test_plan_mode_task_parks_and_generates() {
        let app = test_app();
        let pid = ready_project(&app).await;
        let (status, task) = request(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks", pid),
            Some(serde_json::json!({"description": "needs planning", "plan_mode": true})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task["status"], "plan_pending");

        // Give the background generation (MockAgent default response) a beat.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let task = app.state.store.get_task(&pid, "t-000001").await.unwrap();
        assert_eq!(task.status, TaskStatus::PlanPending);

        let (status, body) = request(
            &app,
            "POST",
            &format!("/api/projects/{}/plan/approve", pid),
            Some(serde_json::json!({"task_id": "t-000001", "approved": true, "answers": {"style": "concise"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "approved");
        let task = app.state.store.get_task(&pid, "t-000001").await.unwrap();
        assert_eq!(task.status, TaskStatus::PlanApproved);
    }

    #[tokio::test]
    async fn test_internal_callback_updates_and_conflicts() {
        let app = test_app();
        let pid = ready_project(&app).await;
        request(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks", pid),
            Some(serde_json::json!({"description": "worked on"})),
        )
        .await;
        // Walk the task into running as the scheduler would.
        app.state.store.claim_next_task("worker-1").await.unwrap().unwrap();
        app.state
            .store
            .update_task(&pid, "t-000001", crate::models::TaskPatch::status(TaskStatus::Running))
            .await
            .unwrap();

        let uri = format!("/api/internal/tasks/{}/t-000001/status", pid);
        let (status, _) = request(
            &app,
            "POST",
            &uri,
            Some(serde_json::json!({"status": "merging", "commit": "abc1234"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Repeating the same callback is a no-op, not an error.
        let (status, _) = request(
            &app,
            "POST",
            &uri,
            Some(serde_json::json!({"status": "merging", "commit": "abc1234"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let task = app.state.store.get_task(&pid, "t-000001").await.unwrap();
        assert_eq!(task.status, TaskStatus::Merging);
        assert_eq!(task.commit_id.as_deref(), Some("abc1234"));

        // An illegal transition is rejected without mutating.
        let (status, _) = request(
            &app,
            "POST",
            &uri,
            Some(serde_json::json!({"status": "running"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        // Unknown status strings are a 400.
        let (status, _) = request(
            &app,
            "POST",
            &uri,
            Some(serde_json::json!({"status": "nonsense"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_internal_callback_rejects_public_peer() {
        let app = test_app();
        let pid = ready_project(&app).await;
        request(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks", pid),
            Some(serde_json::json!({"description": "x"})),
        )
        .await;

        let router = build_router(Arc::clone(&app.state))
            .layer(MockConnectInfo(SocketAddr::from(([203, 0, 113, 7], 40000))));
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/internal/tasks/{}/t-000001/status", pid))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"status": "failed", "error": "x"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_workers_and_events_endpoints() {
        let app = test_app();
        let (status, workers) = request(&app, "GET", "/api/workers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(workers.as_array().unwrap().len(), 1);
        assert_eq!(workers[0]["id"], "worker-1");
        assert_eq!(workers[0]["status"], "idle");

        app.state.events.emit("scheduler", "claimed t-000001 by worker-1");
        let (status, events) = request(&app, "GET", "/api/dispatcher/events?limit=10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(events.as_array().unwrap().iter().any(|e| {
            e["message"].as_str().unwrap_or_default().contains("claimed")
        }));
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let app = test_app();
        let pid = ready_project(&app).await;
        request(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks", pid),
            Some(serde_json::json!({"description": "one"})),
        )
        .await;
        let (status, stats) =
            request(&app, "GET", &format!("/api/projects/{}/stats", pid), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["pending"], 1);
        assert_eq!(stats["success_rate"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_git_endpoints_on_real_repo() {
        let app = test_app();
        let pid = ready_project(&app).await;
        // The setup job already made the initial commit; add one more.
        let repo = app.state.config.repo_dir(&pid);
        let git = Git::new();
        tokio::fs::write(repo.join("README.md"), "# demo\n").await.unwrap();
        git.commit_all(&repo, "add readme").await.unwrap();
        let sha = git.head_sha(&repo).await.unwrap();

        let (status, log) = request(
            &app,
            "GET",
            &format!("/api/projects/{}/git/log?limit=10", pid),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let commits = log["commits"].as_array().unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0]["sha"], sha.as_str());
        assert_eq!(commits[0]["lane"], 0);
        assert_eq!(commits[1]["message"], "Initial commit");

        let (status, detail) = request(
            &app,
            "GET",
            &format!("/api/projects/{}/git/commit/{}", pid, sha),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["body"], "add readme");
        assert_eq!(detail["files"][0]["path"], "README.md");

        let (status, _) = request(
            &app,
            "GET",
            &format!("/api/projects/{}/git/commit/zzzz", pid),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, unpushed) = request(
            &app,
            "GET",
            &format!("/api/projects/{}/git/unpushed", pid),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(unpushed["count"], 0);
        assert_eq!(unpushed["has_remote"], false);
    }

    #[tokio::test]
    async fn test_merge_endpoint_requires_merge_pending() {
        let app = test_app();
        let pid = ready_project(&app).await;
        request(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks", pid),
            Some(serde_json::json!({"description": "not ready"})),
        )
        .await;
        let (status, _) = request(
            &app,
            "POST",
            &format!("/api/projects/{}/tasks/t-000001/merge", pid),
            Some(serde_json::json!({"squash": false})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
