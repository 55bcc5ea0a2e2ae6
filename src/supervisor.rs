//! Process-wide lifecycle: startup (migration, repair, recovery), the
//! background project setup jobs, and graceful shutdown.
//!
//! Startup order matters: the data directory and legacy migration come
//! first, then per-project repair, then the gateway binds, and only once it
//! is listening does stale-task recovery run (a recovered task may be
//! claimed immediately, and its worker needs a live callback endpoint).
//! The scheduler starts last.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::AgentCli;
use crate::config::{Config, INSTRUCTIONS_FILE, INSTRUCTIONS_TEMPLATE};
use crate::events::EventBus;
use crate::experience::ExperienceIndexer;
use crate::git::Git;
use crate::models::{Project, ProjectOrigin, ProjectStatus};
use crate::plan::PlanService;
use crate::runtime::{ContainerRuntime, DockerRuntime, CONTAINER_PREFIX};
use crate::scheduler::Scheduler;
use crate::server::{self, AppState};
use crate::store::Store;

/// Run the whole engine until SIGINT.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;

    let events = Arc::new(EventBus::new());
    let store = Store::new(Arc::clone(&config), Arc::clone(&events));
    let git = Git::new();

    if let Some(migrated) = migrate_legacy_layout(&config)? {
        events.emit("system", format!("migrated legacy task queue into project {}", migrated));
    }
    repair_projects(&store, &config, &git).await;

    let runtime = DockerRuntime::connect()
        .await
        .context("Docker daemon is not reachable; the engine needs it to run worker containers")?;
    match runtime.remove_stale(CONTAINER_PREFIX).await {
        Ok(0) => {}
        Ok(reaped) => events.emit("system", format!("removed {} stale worker containers", reaped)),
        Err(e) => eprintln!("[supervisor] stale container cleanup failed: {}", e),
    }
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);

    let agent = Arc::new(AgentCli::from_config(&config));
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
        config: Arc::clone(&config),
        store: store.clone(),
        events: Arc::clone(&events),
        scheduler: scheduler.clone(),
        plans,
        git: git.clone(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Recovery and the scheduler loop start once the gateway is listening.
    let on_listening = {
        let store = store.clone();
        let events = Arc::clone(&events);
        let scheduler = scheduler.clone();
        let config = Arc::clone(&config);
        let git = git.clone();
        let loop_shutdown = shutdown_rx.clone();
        move |_addr| {
            tokio::spawn(async move {
                recover_stale_tasks(&store, &events, &config, &git).await;
                scheduler.run(loop_shutdown).await;
            });
        }
    };

    let shutdown_signal = {
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            eprintln!("[supervisor] shutting down");
            let _ = shutdown_tx.send(true);
        }
    };

    server::serve(state, on_listening, shutdown_signal).await?;

    // Gateway is down; stop the loop (if the signal future didn't already)
    // and terminate every live container with the shutdown grace.
    let _ = shutdown_tx.send(true);
    scheduler.shutdown().await;
    // Store writes are fsynced on every rename, so there is nothing left to
    // flush here.
    eprintln!("[supervisor] stopped");
    Ok(())
}

/// Recover tasks stranded in intermediate states by an unclean shutdown,
/// then clear the orphaned worktrees and task branches they left behind.
async fn recover_stale_tasks(store: &Store, events: &EventBus, config: &Config, git: &Git) {
    match store.recover_stale(HashSet::new()).await {
        Ok(recovered) if !recovered.is_empty() => {
            for (pid, tid) in &recovered {
                events.emit("system", format!("recovered stale task {} in project {}", tid, pid));
            }
            events.emit(
                "system",
                format!("Recovered {} stale tasks on startup", recovered.len()),
            );
        }
        Ok(_) => {}
        Err(e) => eprintln!("[supervisor] stale recovery failed: {}", e),
    }

    let projects = store.list_projects().await.unwrap_or_default();
    for project in projects {
        let repo = config.repo_dir(&project.id);
        if !repo.join(".git").exists() {
            continue;
        }
        let worktrees = config.worktrees_dir(&project.id);
        if let Ok(mut entries) = tokio::fs::read_dir(&worktrees).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                git.worktree_remove(&repo, &entry.path()).await;
            }
        }
        git.worktree_prune(&repo).await;
        for branch in git.list_branches(&repo, "agent/*").await {
            git.delete_branch(&repo, &branch).await;
        }
    }
}

/// Move a legacy single-project layout (`data/tasks.json`, `data/repo/`)
/// under a `default` project and create the registry. Returns the migrated
/// project id, or None when there is nothing to migrate.
pub fn migrate_legacy_layout(config: &Config) -> Result<Option<String>> {
    let legacy_tasks = config.data_dir.join("tasks.json");
    if !legacy_tasks.exists() || config.registry_file().exists() {
        return Ok(None);
    }

    let project_id = "default".to_string();
    let project_dir = config.project_dir(&project_id);
    for sub in ["logs", "worktrees"] {
        std::fs::create_dir_all(project_dir.join(sub))?;
    }
    std::fs::rename(&legacy_tasks, config.tasks_file(&project_id))
        .context("Failed to move legacy tasks.json")?;

    let legacy_repo = config.data_dir.join("repo");
    let repo_dir = config.repo_dir(&project_id);
    if legacy_repo.is_dir() {
        std::fs::rename(&legacy_repo, &repo_dir).context("Failed to move legacy repo")?;
    } else {
        std::fs::create_dir_all(&repo_dir)?;
    }

    let has_repo = repo_dir.join(".git").exists();
    let project = Project {
        id: project_id.clone(),
        name: "default".to_string(),
        origin: ProjectOrigin::New,
        branch: "main".to_string(),
        auto_merge: true,
        auto_push: false,
        status: if has_repo {
            ProjectStatus::Ready
        } else {
            ProjectStatus::Error
        },
        error: (!has_repo).then(|| "legacy project has no repository".to_string()),
        task_timeout_secs: None,
        created_at: crate::models::now_iso(),
    };
    let registry = serde_json::json!({
        "projects": [project],
        "next_task_seq": 0,
    });
    std::fs::write(
        config.registry_file(),
        serde_json::to_vec_pretty(&registry)?,
    )?;
    Ok(Some(project_id))
}

/// Per-project self-repair at startup: recreate missing directories and
/// files, refresh remotes, keep the instructions file out of tracking.
pub async fn repair_projects(store: &Store, config: &Config, git: &Git) {
    let projects = match store.list_projects().await {
        Ok(projects) => projects,
        Err(e) => {
            eprintln!("[supervisor] cannot list projects for repair: {}", e);
            return;
        }
    };

    for project in projects {
        let _ = tokio::fs::create_dir_all(config.logs_dir(&project.id)).await;
        let _ = tokio::fs::create_dir_all(config.worktrees_dir(&project.id)).await;
        let tasks_file = config.tasks_file(&project.id);
        if !tasks_file.exists() {
            let _ = tokio::fs::write(&tasks_file, b"{\n  \"tasks\": []\n}").await;
        }

        let repo = config.repo_dir(&project.id);
        if !repo.join(".git").exists() {
            continue;
        }
        if git.has_remote(&repo).await {
            git.fetch(&repo, "origin").await;
        }
        inject_instructions(git, &repo).await;
        let _ = ExperienceIndexer::ensure_progress_file(&repo).await;
    }
}

/// Drop the instructions file into a repo and make sure git never tracks it.
async fn inject_instructions(git: &Git, repo: &Path) {
    let path = repo.join(INSTRUCTIONS_FILE);
    if !path.exists() {
        let _ = tokio::fs::write(&path, INSTRUCTIONS_TEMPLATE).await;
    }
    if let Err(e) = git.exclude_from_tracking(repo, INSTRUCTIONS_FILE).await {
        eprintln!("[supervisor] cannot exclude {}: {}", INSTRUCTIONS_FILE, e.excerpt());
    }
}

/// Kick off the asynchronous repository setup for a newly created (or
/// retried) project. The project stays `cloning` until this finishes.
pub fn spawn_project_setup(
    store: Store,
    config: Arc<Config>,
    git: Git,
    events: Arc<EventBus>,
    project: Project,
) {
    tokio::spawn(async move {
        let outcome = setup_project(&store, &config, &git, &project).await;
        let (status, error) = match outcome {
            Ok(()) => (ProjectStatus::Ready, None),
            Err(e) => (ProjectStatus::Error, Some(truncate(&format!("{:#}", e), 300))),
        };
        if let Some(error) = &error {
            events.emit("system", format!("project {} setup failed: {}", project.name, error));
        } else {
            events.emit("system", format!("project {} ready", project.name));
        }
        if let Err(e) = store
            .update_project_status(&project.id, status, error)
            .await
        {
            eprintln!("[supervisor] cannot record setup outcome for {}: {}", project.id, e);
        }
    });
}

async fn setup_project(store: &Store, config: &Config, git: &Git, project: &Project) -> Result<()> {
    let repo = config.repo_dir(&project.id);
    match &project.origin {
        ProjectOrigin::New => {
            tokio::fs::create_dir_all(&repo).await?;
            git.init_new(&repo).await.map_err(|e| anyhow::anyhow!(e.excerpt()))?;
            ExperienceIndexer::ensure_progress_file(&repo).await?;
            inject_instructions(git, &repo).await;
            git.commit_all(&repo, "Initial commit")
                .await
                .map_err(|e| anyhow::anyhow!(e.excerpt()))?;
            Ok(())
        }
        ProjectOrigin::Local { path } => {
            let source = Path::new(path);
            anyhow::ensure!(source.is_dir(), "Local path does not exist: {}", path);
            anyhow::ensure!(
                source.join(".git").is_dir(),
                "Not a git repository: {}",
                path
            );

            // Replace the placeholder repo dir with a symlink to the clone.
            if repo.is_symlink() {
                tokio::fs::remove_file(&repo).await?;
            } else if repo.is_dir() {
                tokio::fs::remove_dir_all(&repo).await?;
            }
            tokio::fs::symlink(source, &repo)
                .await
                .context("Failed to link local repository")?;

            ExperienceIndexer::ensure_progress_file(&repo).await?;
            inject_instructions(git, &repo).await;

            // The project's base branch is whatever the local clone is on.
            if let Ok(branch) = git.current_branch(&repo).await
                && !branch.is_empty()
                && branch != "HEAD"
            {
                let _ = store.set_project_branch(&project.id, &branch).await;
            }
            Ok(())
        }
        ProjectOrigin::Git { repo_url } => {
            // `git clone` wants to create the directory itself.
            if repo.is_dir() {
                tokio::fs::remove_dir_all(&repo).await?;
            }
            git.clone_repo(repo_url, &project.branch, &repo)
                .await
                .map_err(|e| anyhow::anyhow!("Clone failed: {}", truncate(e.stderr.trim(), 300)))?;
            let _ = git.set_identity(&repo).await;
            ExperienceIndexer::ensure_progress_file(&repo).await?;
            inject_instructions(git, &repo).await;
            Ok(())
        }
    }
}

fn truncate(s: &str, limit: usize) -> String {
    let mut out = s.to_string();
    if out.len() > limit {
        let mut end = limit;
        while end > 0 && !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    out
}
