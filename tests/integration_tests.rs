//! End-to-end scenarios across the store, plan service, and scheduler
//! surfaces, using scratch data directories and scripted agents.

use std::collections::HashSet;
use std::sync::Arc;

use shipyard::agent::{Agent, MockAgent};
use shipyard::config::Config;
use shipyard::events::EventBus;
use shipyard::models::{ProjectCreate, ProjectStatus, TaskCreate, TaskPatch, TaskStatus};
use shipyard::plan::PlanService;
use shipyard::store::Store;

struct Env {
    _data: tempfile::TempDir,
    config: Arc<Config>,
    store: Store,
    events: Arc<EventBus>,
}

fn env() -> Env {
    let data = tempfile::tempdir().unwrap();
    let config = Arc::new(Config {
        data_dir: data.path().to_path_buf(),
        ..Config::default()
    });
    let events = Arc::new(EventBus::new());
    let store = Store::new(Arc::clone(&config), Arc::clone(&events));
    Env {
        _data: data,
        config,
        store,
        events,
    }
}

async fn ready_project(env: &Env, name: &str) -> String {
    let project = env
        .store
        .create_project(ProjectCreate {
            name: name.to_string(),
            repo_url: None,
            branch: "main".to_string(),
            source_type: "new".to_string(),
            auto_merge: true,
            auto_push: false,
        })
        .await
        .unwrap();
    env.store
        .update_project_status(&project.id, ProjectStatus::Ready, None)
        .await
        .unwrap();
    project.id
}

fn task(description: &str) -> TaskCreate {
    TaskCreate {
        description: description.to_string(),
        priority: 0,
        depends_on: None,
        plan_mode: false,
    }
}

/// One worker, two projects with equal-priority pending tasks: the older
/// task wins, and after it finishes the other project gets its turn.
#[tokio::test]
async fn cross_project_claim_fairness() {
    let env = env();
    let p1 = ready_project(&env, "first").await;
    let p2 = ready_project(&env, "second").await;

    let t1 = env.store.create_task(&p1, task("older")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let t2 = env.store.create_task(&p2, task("newer")).await.unwrap();

    let (pid, claimed) = env.store.claim_next_task("worker-1").await.unwrap().unwrap();
    assert_eq!(pid, p1);
    assert_eq!(claimed.id, t1.id);
    // The single worker is busy; nothing else can be claimed by it until the
    // task finishes, and the other pending task stays untouched.
    let waiting = env.store.get_task(&p2, &t2.id).await.unwrap();
    assert_eq!(waiting.status, TaskStatus::Pending);

    for status in [TaskStatus::Running, TaskStatus::Merging, TaskStatus::Completed] {
        env.store
            .update_task(&p1, &t1.id, TaskPatch::status(status))
            .await
            .unwrap();
    }

    let (pid, claimed) = env.store.claim_next_task("worker-1").await.unwrap().unwrap();
    assert_eq!(pid, p2);
    assert_eq!(claimed.id, t2.id);
}

/// Engine dies while a task runs; the next startup returns it to `pending`
/// with a priority boost and it gets claimed again.
#[tokio::test]
async fn stale_task_recovery_after_restart() {
    let env = env();
    let pid = ready_project(&env, "crashy").await;
    let t = env.store.create_task(&pid, task("interrupted")).await.unwrap();
    env.store.claim_next_task("worker-1").await.unwrap().unwrap();
    env.store
        .update_task(&pid, &t.id, TaskPatch::status(TaskStatus::Running))
        .await
        .unwrap();

    // "Restart": a fresh store over the same data directory.
    let store2 = Store::new(Arc::clone(&env.config), Arc::new(EventBus::new()));
    let recovered = store2.recover_stale(HashSet::new()).await.unwrap();
    assert_eq!(recovered, vec![(pid.clone(), t.id.clone())]);

    let after = store2.get_task(&pid, &t.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.priority, 1);
    assert_eq!(after.worker_id, None);

    let (_, reclaimed) = store2.claim_next_task("worker-1").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, t.id);
}

/// A malformed registry on startup is quarantined, replaced with an empty
/// one, and announced on the system topic.
#[tokio::test]
async fn malformed_registry_is_quarantined() {
    let env = env();
    std::fs::write(env.config.registry_file(), b"{definitely not json").unwrap();

    assert!(env.store.list_projects().await.unwrap().is_empty());

    let messages: Vec<String> = env
        .events
        .recent(10)
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert!(
        messages.iter().any(|m| m.contains("quarantined projects.json")),
        "events: {:?}",
        messages
    );
    let quarantined = std::fs::read_dir(env.config.data_dir.clone())
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().contains("projects.json.corrupt"));
    assert!(quarantined);
}

/// Plan generate → approve with answers → the claimed task carries exactly
/// the recorded plan and answers.
#[tokio::test]
async fn plan_roundtrip_reaches_claim() {
    let env = env();
    let pid = ready_project(&env, "planned").await;
    let t = env
        .store
        .create_task(
            &pid,
            TaskCreate {
                description: "restructure the config loader".to_string(),
                priority: 0,
                depends_on: None,
                plan_mode: true,
            },
        )
        .await
        .unwrap();

    let agent = Arc::new(MockAgent::new());
    agent.push_text("## Plan\n1. split loader\n2. add tests");
    let plans = PlanService::new(
        env.store.clone(),
        Arc::clone(&agent) as Arc<dyn Agent>,
        Arc::clone(&env.events),
        Arc::clone(&env.config),
    );

    plans.generate(&pid, &t.id).await.unwrap();
    let pending = env.store.get_task(&pid, &t.id).await.unwrap();
    assert_eq!(pending.status, TaskStatus::PlanPending);

    let mut answers = serde_json::Map::new();
    answers.insert(
        "style".to_string(),
        serde_json::Value::String("concise".to_string()),
    );
    plans
        .approve(&pid, &t.id, true, Some(answers.clone()), None)
        .await
        .unwrap();

    let (_, claimed) = env.store.claim_next_task("worker-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, t.id);
    assert!(claimed.plan_approved);
    let plan = claimed.plan.unwrap();
    assert!(plan.contains("1. split loader"));
    assert!(plan.contains("- **style**: concise"));
    assert_eq!(claimed.plan_answers.unwrap(), answers);
}

/// The worker-binding invariant holds through a full lifecycle driven via
/// store transitions alone.
#[tokio::test]
async fn worker_binding_invariant() {
    let env = env();
    let pid = ready_project(&env, "invariants").await;
    let t = env.store.create_task(&pid, task("observe")).await.unwrap();

    let check = |task: &shipyard::models::Task| {
        assert_eq!(
            task.worker_id.is_some(),
            task.status.is_active(),
            "binding invariant violated at {:?}",
            task.status
        );
    };

    check(&env.store.get_task(&pid, &t.id).await.unwrap());
    let (_, claimed) = env.store.claim_next_task("worker-1").await.unwrap().unwrap();
    check(&claimed);
    for status in [TaskStatus::Running, TaskStatus::Merging, TaskStatus::Testing] {
        let updated = env
            .store
            .update_task(&pid, &t.id, TaskPatch::status(status))
            .await
            .unwrap();
        check(&updated);
    }
    let done = env
        .store
        .update_task(&pid, &t.id, TaskPatch::status(TaskStatus::Completed))
        .await
        .unwrap();
    check(&done);
    assert!(done.completed_at.is_some());
}
