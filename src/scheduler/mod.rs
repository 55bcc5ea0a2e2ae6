//! The control loop that binds tasks to worker slots and drives each task's
//! state machine to completion.
//!
//! One ticking loop claims work for idle slots; every claimed task runs its
//! full lifecycle in a spawned job: worktree setup, container launch, log
//! forwarding, exit/callback reconciliation, merge-and-test, auto-merge, and
//! cleanup. Per-project git operations serialize on a lock map so merges
//! never race fetches or pushes on the same repository.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;

use crate::agent::Agent;
use crate::config::{Config, INSTRUCTIONS_FILE, INSTRUCTIONS_TEMPLATE};
use crate::errors::StoreError;
use crate::events::{log_topic, EventBus};
use crate::experience::{CompletionRecord, ExperienceIndexer};
use crate::git::Git;
use crate::merge::{MergeContext, MergeOutcome, MergeTestEngine};
use crate::models::{Project, Task, TaskPatch, TaskStatus, WorkerState, WorkerStatus};
use crate::runtime::{Bind, ContainerHandle, ContainerRuntime, ContainerSpec, CONTAINER_PREFIX};
use crate::store::Store;
use crate::stream::LineParser;

const TICK: Duration = Duration::from_secs(1);
/// SIGTERM-to-SIGKILL window when stopping containers.
const STOP_GRACE: Duration = Duration::from_secs(15);

// ── Worker pool ───────────────────────────────────────────────────────

/// In-memory worker slots, `worker-1..worker-N`. Rebuilt at startup; the
/// store never persists worker state.
pub struct WorkerPool {
    workers: std::sync::Mutex<Vec<WorkerState>>,
}

impl WorkerPool {
    pub fn new(count: usize) -> Self {
        let workers = (1..=count)
            .map(|i| WorkerState::idle(format!("worker-{}", i)))
            .collect();
        Self {
            workers: std::sync::Mutex::new(workers),
        }
    }

    /// Match the pool to the configured size: surplus idle slots stop,
    /// missing slots are created, previously stopped slots within the limit
    /// come back.
    pub fn reconcile(&self, count: usize) {
        let mut workers = self.workers.lock().unwrap();
        for (i, worker) in workers.iter_mut().enumerate() {
            if i < count {
                if worker.status == WorkerStatus::Stopped {
                    worker.status = WorkerStatus::Idle;
                }
            } else if worker.status == WorkerStatus::Idle {
                worker.status = WorkerStatus::Stopped;
            }
        }
        while workers.len() < count {
            let id = format!("worker-{}", workers.len() + 1);
            workers.push(WorkerState::idle(id));
        }
    }

    pub fn get_idle(&self) -> Option<String> {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.status == WorkerStatus::Idle)
            .map(|w| w.id.clone())
    }

    pub fn mark_busy(&self, worker_id: &str, task_id: &str, task_title: &str) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
            worker.status = WorkerStatus::Busy;
            worker.current_task_id = Some(task_id.to_string());
            worker.current_task_title = Some(task_title.to_string());
            worker.last_activity = Some(crate::models::now_iso());
        }
    }

    pub fn set_container(&self, worker_id: &str, container_id: Option<String>) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
            worker.container_id = container_id;
            worker.last_activity = Some(crate::models::now_iso());
        }
    }

    pub fn mark_idle(&self, worker_id: &str, completed: bool) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
            if worker.status != WorkerStatus::Stopped {
                worker.status = WorkerStatus::Idle;
            }
            worker.container_id = None;
            worker.current_task_id = None;
            worker.current_task_title = None;
            worker.last_activity = Some(crate::models::now_iso());
            if completed {
                worker.tasks_completed += 1;
            }
        }
    }

    pub fn set_error(&self, worker_id: &str) {
        let mut workers = self.workers.lock().unwrap();
        if let Some(worker) = workers.iter_mut().find(|w| w.id == worker_id) {
            worker.status = WorkerStatus::Error;
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerState> {
        self.workers.lock().unwrap().clone()
    }
}

// ── Per-project git lock map ──────────────────────────────────────────

/// Only one operation (merge-test, auto-merge, manual merge, push) runs
/// against a project's repo root at a time.
#[derive(Default)]
pub struct GitLockMap {
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitLockMap {
    pub async fn lock(&self, project_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(
                locks
                    .entry(project_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────

pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    store: Store,
    events: Arc<EventBus>,
    git: Git,
    runtime: Arc<dyn ContainerRuntime>,
    pool: WorkerPool,
    git_locks: GitLockMap,
    containers: tokio::sync::Mutex<HashMap<String, ContainerHandle>>,
    merge_engine: MergeTestEngine,
    experience: ExperienceIndexer,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        events: Arc<EventBus>,
        runtime: Arc<dyn ContainerRuntime>,
        agent: Arc<dyn Agent>,
    ) -> Self {
        let git = Git::new();
        let merge_engine = MergeTestEngine::new(
            git.clone(),
            Arc::clone(&agent),
            store.clone(),
            Arc::clone(&events),
        );
        let experience = ExperienceIndexer::new(Arc::clone(&agent), git.clone());
        let pool = WorkerPool::new(config.worker_count);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                events,
                git,
                runtime,
                pool,
                git_locks: GitLockMap::default(),
                containers: tokio::sync::Mutex::new(HashMap::new()),
                merge_engine,
                experience,
            }),
        }
    }

    pub fn workers(&self) -> Vec<WorkerState> {
        self.inner.pool.snapshot()
    }

    /// Serialize an external git operation (push endpoint) with the
    /// scheduler's own repo-root operations.
    pub async fn lock_project(&self, project_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        self.inner.git_locks.lock(project_id).await
    }

    /// Worker ids whose containers are currently live, for stale-task
    /// recovery at startup.
    pub async fn live_worker_ids(&self) -> HashSet<String> {
        self.inner
            .containers
            .lock()
            .await
            .keys()
            .cloned()
            .collect()
    }

    /// Main control loop. Ticks roughly once a second until `shutdown`
    /// flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.inner.events.emit("scheduler", "scheduler started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.inner.pool.reconcile(self.inner.config.worker_count);

            while let Some(worker_id) = self.inner.pool.get_idle() {
                match self.inner.store.claim_next_task(&worker_id).await {
                    Ok(Some((project_id, task))) => {
                        self.inner.events.emit(
                            "scheduler",
                            format!("claimed {} by {}", task.id, worker_id),
                        );
                        self.inner.pool.mark_busy(&worker_id, &task.id, &task.title);
                        let inner = Arc::clone(&self.inner);
                        tokio::spawn(async move {
                            inner.handle_task(worker_id, project_id, task).await;
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("[scheduler] claim failed: {}", e);
                        break;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(TICK) => {}
                _ = shutdown.changed() => {}
            }
        }
        self.inner.events.emit("scheduler", "scheduler stopped");
    }

    /// Cancel a task: stop its container if running, mark it cancelled, and
    /// clean up its worktree and branch.
    pub async fn cancel_task(&self, project_id: &str, task_id: &str) -> Result<(), StoreError> {
        let task = self.inner.store.get_task(project_id, task_id).await?;

        if task.status.is_active() {
            if let Some(worker_id) = &task.worker_id {
                let handle = self.inner.containers.lock().await.get(worker_id).cloned();
                if let Some(handle) = handle {
                    let _ = self.inner.runtime.stop(&handle, STOP_GRACE).await;
                }
            }
            self.inner
                .store
                .update_task(project_id, task_id, TaskPatch::status(TaskStatus::Cancelled))
                .await?;
            if let Some(worker_id) = &task.worker_id {
                let repo = self.inner.config.repo_dir(project_id);
                let worktree = self.inner.config.worktree_dir(project_id, worker_id);
                let branch = self.inner.config.task_branch(task_id);
                self.inner.git.worktree_remove(&repo, &worktree).await;
                self.inner.git.worktree_prune(&repo).await;
                self.inner.git.delete_branch(&repo, &branch).await;
            }
        } else {
            // Validated transition: completed tasks (and double cancels)
            // surface Conflict untouched.
            self.inner
                .store
                .update_task(project_id, task_id, TaskPatch::status(TaskStatus::Cancelled))
                .await?;
            if task.status == TaskStatus::MergePending {
                let repo = self.inner.config.repo_dir(project_id);
                self.inner
                    .git
                    .delete_branch(&repo, &self.inner.config.task_branch(task_id))
                    .await;
            }
        }
        self.inner
            .events
            .emit("scheduler", format!("cancelled {}", task_id));
        Ok(())
    }

    /// Reset a terminal-but-not-completed task to `pending`. A
    /// `merge_pending` retry drops its branch; the plan survives only if it
    /// was approved.
    pub async fn retry_task(&self, project_id: &str, task_id: &str) -> Result<Task, StoreError> {
        let task = self.inner.store.get_task(project_id, task_id).await?;
        if !task.status.is_retryable() {
            return Err(StoreError::Conflict {
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        if task.status == TaskStatus::MergePending {
            let repo = self.inner.config.repo_dir(project_id);
            self.inner
                .git
                .delete_branch(&repo, &self.inner.config.task_branch(task_id))
                .await;
        }
        let patch = TaskPatch {
            status: Some(TaskStatus::Pending),
            worker_id: Some(None),
            error: Some(None),
            commit_id: Some(None),
            plan: if task.plan_approved { None } else { Some(None) },
            ..Default::default()
        };
        self.inner.store.update_task(project_id, task_id, patch).await
    }

    /// Manual merge of a `merge_pending` task, optionally squashed.
    /// Returns the final commit sha.
    pub async fn manual_merge(
        &self,
        project_id: &str,
        task_id: &str,
        squash: bool,
    ) -> Result<String, StoreError> {
        let project = self.inner.store.get_project(project_id).await?;
        let base = project.branch.clone();
        let repo = self.inner.config.repo_dir(project_id);

        let _lock = self.inner.git_locks.lock(project_id).await;
        let task = self.inner.store.get_task(project_id, task_id).await?;
        if task.status != TaskStatus::MergePending {
            return Err(StoreError::Conflict {
                from: task.status,
                to: TaskStatus::Completed,
            });
        }
        let branch = task
            .branch
            .clone()
            .ok_or_else(|| StoreError::Other(anyhow::anyhow!("task has no branch")))?;

        let git = &self.inner.git;
        git.fetch(&repo, "origin").await;
        git.checkout_base(&repo, &base)
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!(e.excerpt())))?;
        self.remove_untracked_instructions(&repo).await;

        if squash {
            let merged = git
                .merge(&repo, &branch, true)
                .await
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e.excerpt())))?;
            if !merged {
                return Err(StoreError::Other(anyhow::anyhow!(
                    "squash merge of {} failed",
                    branch
                )));
            }
            git.commit(&repo, &format!("feat: {} (task {})", task.title, task_id))
                .await
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e.excerpt())))?;
        } else {
            let merged = git
                .merge(&repo, &branch, false)
                .await
                .map_err(|e| StoreError::Other(anyhow::anyhow!(e.excerpt())))?;
            if !merged {
                return Err(StoreError::Other(anyhow::anyhow!(
                    "merge of {} failed with conflicts",
                    branch
                )));
            }
        }

        let commit = git
            .head_sha(&repo)
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!(e.excerpt())))?;
        git.delete_branch(&repo, &branch).await;
        self.inner
            .store
            .update_task(
                project_id,
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    commit_id: Some(Some(commit.clone())),
                    ..Default::default()
                },
            )
            .await?;
        self.inner
            .events
            .emit("scheduler", format!("merged {} into {}", task_id, base));
        Ok(commit)
    }

    async fn remove_untracked_instructions(&self, repo: &Path) {
        let path = repo.join(INSTRUCTIONS_FILE);
        if path.exists() && !self.inner.git.is_tracked(repo, INSTRUCTIONS_FILE).await {
            let _ = tokio::fs::remove_file(&path).await;
        }
    }

    /// Stop a worker's container (the UI's restart action). The task flow
    /// observes the exit and fails the task normally.
    pub async fn stop_worker(&self, worker_id: &str) -> bool {
        let handle = self.inner.containers.lock().await.get(worker_id).cloned();
        match handle {
            Some(handle) => {
                let _ = self.inner.runtime.stop(&handle, Duration::from_secs(10)).await;
                true
            }
            None => false,
        }
    }

    /// Stop every live container with the shutdown grace period.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, ContainerHandle)> =
            self.inner.containers.lock().await.drain().collect();
        for (worker_id, handle) in handles {
            eprintln!("[scheduler] stopping container for {}", worker_id);
            let _ = self.inner.runtime.stop(&handle, STOP_GRACE).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn handle_task_direct(&self, worker_id: String, project_id: String, task: Task) {
        self.inner.pool.mark_busy(&worker_id, &task.id, &task.title);
        Arc::clone(&self.inner)
            .handle_task(worker_id, project_id, task)
            .await;
    }
}

impl Inner {
    /// Full lifecycle for one claimed task.
    async fn handle_task(self: Arc<Self>, worker_id: String, project_id: String, task: Task) {
        let project = match self.store.get_project(&project_id).await {
            Ok(project) => project,
            Err(e) => {
                eprintln!("[scheduler] project {} lookup failed: {}", project_id, e);
                let _ = self
                    .store
                    .update_task(&project_id, &task.id, TaskPatch::failed("project not found"))
                    .await;
                self.pool.mark_idle(&worker_id, false);
                return;
            }
        };

        let repo = self.config.repo_dir(&project_id);
        let worktree = self.config.worktree_dir(&project_id, &worker_id);
        let branch = self.config.task_branch(&task.id);
        let base = project.branch.clone();
        let log_file = self.config.worker_log_file(&project_id, &worker_id);
        let _ = tokio::fs::create_dir_all(self.config.logs_dir(&project_id)).await;
        let _ = tokio::fs::create_dir_all(self.config.worktrees_dir(&project_id)).await;

        // 1. Worktree on a fresh task branch.
        self.events
            .emit(&worker_id, format!("creating worktree on branch {}", branch));
        let base_ref = match self.prepare_worktree(&repo, &worktree, &branch, &base).await {
            Ok(base_ref) => base_ref,
            Err(reason) => {
                self.fail_and_cleanup(&project_id, &task.id, &worker_id, &reason, true)
                    .await;
                return;
            }
        };
        let _ = self
            .store
            .update_task(
                &project_id,
                &task.id,
                TaskPatch {
                    branch: Some(Some(branch.clone())),
                    ..Default::default()
                },
            )
            .await;

        // 2. Prompt context from the experience log.
        let recent = self.experience.recent_entries(&repo).await;
        let cross = {
            let others: Vec<(String, std::path::PathBuf)> = self
                .store
                .list_projects()
                .await
                .unwrap_or_default()
                .into_iter()
                .filter(|p| p.id != project_id)
                .map(|p| (p.name.clone(), self.config.repo_dir(&p.id)))
                .collect();
            self.experience
                .cross_project(&others, &task.title, &task.description)
                .await
        };
        if !cross.is_empty() {
            self.events
                .emit(&worker_id, "loaded cross-project experience context");
        }
        let prompt = compose_worker_prompt(&task, &recent, &cross);

        // 3. Pointer snapshot before the container can touch the mount.
        let link_snapshot = match self.git.snapshot_worktree_link(&worktree).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.fail_and_cleanup(&project_id, &task.id, &worker_id, &e.excerpt(), true)
                    .await;
                return;
            }
        };

        // 4. Launch the container; one retry on start failure.
        let spec = self.container_spec(&project, &task, &worker_id, &branch, &prompt);
        let handle = match self.start_with_retry(spec).await {
            Ok(handle) => handle,
            Err(reason) => {
                self.fail_and_cleanup(&project_id, &task.id, &worker_id, &reason, true)
                    .await;
                self.pool.set_error(&worker_id);
                return;
            }
        };
        self.containers
            .lock()
            .await
            .insert(worker_id.clone(), handle.clone());
        self.pool.set_container(&worker_id, Some(handle.id.clone()));
        if let Err(e) = self
            .store
            .update_task(&project_id, &task.id, TaskPatch::status(TaskStatus::Running))
            .await
        {
            eprintln!("[scheduler] cannot mark {} running: {}", task.id, e);
        }
        self.events
            .emit(&worker_id, format!("task {} running: {}", task.id, task.title));

        // 5. Forward the container's stream to subscribers.
        self.spawn_log_forwarder(&worker_id, &handle).await;

        // 6. Wait for exit, bounded by the soft timeout.
        let timeout = project
            .task_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.task_timeout);
        let exit_code = tokio::select! {
            exit = self.runtime.wait(&handle) => exit.unwrap_or(-1),
            _ = tokio::time::sleep(timeout) => {
                let _ = self.runtime.stop(&handle, STOP_GRACE).await;
                self.containers.lock().await.remove(&worker_id);
                self.pool.set_container(&worker_id, None);
                let reason = format!("exceeded {} minutes", timeout.as_secs() / 60);
                self.fail_and_cleanup(&project_id, &task.id, &worker_id, &reason, true).await;
                return;
            }
        };
        self.containers.lock().await.remove(&worker_id);
        self.pool.set_container(&worker_id, None);
        self.events
            .emit(&worker_id, format!("container exited (code {})", exit_code));

        // 7. The pointer must have survived the container.
        if !self.git.verify_worktree_link(&worktree, &link_snapshot).await {
            self.fail_and_cleanup(
                &project_id,
                &task.id,
                &worker_id,
                "worktree corruption",
                true,
            )
            .await;
            return;
        }

        // 8. Reconcile exit code with the status callback.
        let current = match self
            .await_callback(&project_id, &task.id, exit_code)
            .await
        {
            Some(task) => task,
            None => {
                self.cleanup_worktree(&repo, &worktree, &branch, true).await;
                self.pool.mark_idle(&worker_id, false);
                return;
            }
        };
        match current.status {
            TaskStatus::Cancelled | TaskStatus::Failed => {
                if let Some(error) = &current.error {
                    self.events
                        .emit(&worker_id, format!("task {} failed: {}", task.id, error));
                }
                self.cleanup_worktree(&repo, &worktree, &branch, true).await;
                self.pool.mark_idle(&worker_id, false);
                return;
            }
            _ => {}
        }

        // 9. The branch must actually carry new commits.
        if self.git.head_sha(&worktree).await.is_err() {
            self.fail_and_cleanup(
                &project_id,
                &task.id,
                &worker_id,
                "no valid commit found in worktree after worker completed",
                true,
            )
            .await;
            return;
        }
        if base_ref != "HEAD" {
            let new_commits = self
                .git
                .rev_list_count(&worktree, &format!("{}..HEAD", base_ref))
                .await
                .unwrap_or(0);
            if new_commits == 0 {
                self.fail_and_cleanup(
                    &project_id,
                    &task.id,
                    &worker_id,
                    "worker produced no new commits on branch",
                    true,
                )
                .await;
                return;
            }
        }

        if current.status != TaskStatus::Merging
            && self
                .store
                .update_task(&project_id, &task.id, TaskPatch::status(TaskStatus::Merging))
                .await
                .is_err()
        {
            self.cleanup_worktree(&repo, &worktree, &branch, true).await;
            self.pool.mark_idle(&worker_id, false);
            return;
        }
        self.events
            .emit(&worker_id, format!("task {} merging", task.id));

        // 10. Merge-and-test, then honor the project flags — serialized per
        // project.
        let completed = {
            let _lock = self.git_locks.lock(&project_id).await;
            let ctx = MergeContext {
                worktree: worktree.clone(),
                repo: repo.clone(),
                base_branch: base.clone(),
                worker_id: worker_id.clone(),
                project_id: project_id.clone(),
                task_id: task.id.clone(),
            };
            match self.merge_engine.run(&ctx).await {
                MergeOutcome::Failed(reason) => {
                    self.fail_and_cleanup(
                        &project_id,
                        &task.id,
                        &worker_id,
                        &format!("merge or test failed: {}", reason),
                        true,
                    )
                    .await;
                    return;
                }
                MergeOutcome::Ok(_) => {
                    self.finish_merged_task(
                        &project, &task, &worker_id, &repo, &worktree, &branch, &log_file,
                    )
                    .await
                }
            }
        };
        self.pool.mark_idle(&worker_id, completed);
    }

    /// Post-merge-test: auto-merge into base or park as `merge_pending`.
    /// Returns whether the task completed.
    #[allow(clippy::too_many_arguments)]
    async fn finish_merged_task(
        &self,
        project: &Project,
        task: &Task,
        worker_id: &str,
        repo: &Path,
        worktree: &Path,
        branch: &str,
        log_file: &Path,
    ) -> bool {
        let project_id = &project.id;
        let base = project.branch.as_str();

        if project.auto_merge {
            if let Some(final_commit) = self.auto_merge_branch(project, repo, branch, base).await {
                let _ = self
                    .store
                    .update_task(
                        project_id,
                        &task.id,
                        TaskPatch {
                            status: Some(TaskStatus::Completed),
                            commit_id: Some(Some(final_commit.clone())),
                            ..Default::default()
                        },
                    )
                    .await;
                self.events
                    .emit(worker_id, format!("task {} completed: {}", task.id, task.title));
                self.experience
                    .record_completion(
                        repo,
                        CompletionRecord {
                            task_id: &task.id,
                            task_title: &task.title,
                            worker_id,
                            commit_id: &final_commit,
                            log_file,
                        },
                    )
                    .await;
                self.cleanup_worktree(repo, worktree, branch, true).await;
                if project.auto_push && self.git.has_remote(repo).await {
                    self.git.delete_remote_branch(repo, "origin", branch).await;
                }
                return true;
            }
            // Merge into base hit conflicts: hand over to a human.
            let final_commit = self
                .git
                .head_sha(worktree)
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            let _ = self
                .store
                .update_task(
                    project_id,
                    &task.id,
                    TaskPatch {
                        status: Some(TaskStatus::MergePending),
                        commit_id: Some(Some(final_commit.clone())),
                        ..Default::default()
                    },
                )
                .await;
            self.events.emit(
                worker_id,
                format!("auto-merge failed, kept branch {} for manual merge", branch),
            );
            self.experience
                .record_completion(
                    repo,
                    CompletionRecord {
                        task_id: &task.id,
                        task_title: &task.title,
                        worker_id,
                        commit_id: &final_commit,
                        log_file,
                    },
                )
                .await;
            self.cleanup_worktree(repo, worktree, branch, false).await;
            return false;
        }

        // Manual-merge project: park the branch.
        let final_commit = self
            .git
            .head_sha(worktree)
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = self
            .store
            .update_task(
                project_id,
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::MergePending),
                    commit_id: Some(Some(final_commit.clone())),
                    ..Default::default()
                },
            )
            .await;
        self.events
            .emit(worker_id, format!("task {} ready for merge: {}", task.id, task.title));
        self.experience
            .record_completion(
                repo,
                CompletionRecord {
                    task_id: &task.id,
                    task_title: &task.title,
                    worker_id,
                    commit_id: &final_commit,
                    log_file,
                },
            )
            .await;
        self.cleanup_worktree(repo, worktree, branch, false).await;
        false
    }

    /// Merge the task branch into base inside the repo root. Returns the
    /// final sha, or None when the merge must go to a human.
    async fn auto_merge_branch(
        &self,
        project: &Project,
        repo: &Path,
        branch: &str,
        base: &str,
    ) -> Option<String> {
        let stash_msg = format!("auto-merge preflight {}", crate::models::now_iso());
        if let Err(e) = self.git.stash_all(repo, &stash_msg).await {
            eprintln!("[scheduler] cannot prepare clean repo for auto-merge: {}", e.excerpt());
            return None;
        }
        let instructions = repo.join(INSTRUCTIONS_FILE);
        if instructions.exists() && !self.git.is_tracked(repo, INSTRUCTIONS_FILE).await {
            let _ = tokio::fs::remove_file(&instructions).await;
        }

        if let Err(e) = self.git.checkout_base(repo, base).await {
            eprintln!("[scheduler] cannot checkout {}: {}", base, e.excerpt());
            return None;
        }
        self.git.ref_sha(repo, branch).await?;
        match self.git.merge(repo, branch, false).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                eprintln!("[scheduler] merge failed: {}", e.excerpt());
                return None;
            }
        }
        if project.auto_push && self.git.has_remote(repo).await {
            if let Err(e) = self.git.push(repo, "origin", base).await {
                eprintln!("[scheduler] push failed: {}", e.excerpt());
            }
        }
        self.git.head_sha(repo).await.ok()
    }

    /// Build the worktree for a task branch, clearing any stale state that
    /// references the branch. Returns the resolved base ref.
    async fn prepare_worktree(
        &self,
        repo: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> Result<String, String> {
        let git = &self.git;
        if worktree.is_dir() {
            git.worktree_remove(repo, worktree).await;
        }
        git.fetch(repo, "origin").await;
        let base_ref = git.resolve_base_ref(repo, base).await;
        git.remove_worktree_holding_branch(repo, branch).await;
        git.worktree_prune(repo).await;
        git.delete_branch(repo, branch).await;
        git.worktree_add(repo, branch, worktree, &base_ref)
            .await
            .map_err(|e| format!("worktree creation failed: {}", e.excerpt()))?;

        // Instructions file, kept out of version control.
        let instructions = worktree.join(INSTRUCTIONS_FILE);
        if tokio::fs::write(&instructions, INSTRUCTIONS_TEMPLATE).await.is_ok() {
            let _ = git.exclude_from_tracking(worktree, INSTRUCTIONS_FILE).await;
        }
        Ok(base_ref)
    }

    fn container_spec(
        &self,
        project: &Project,
        task: &Task,
        worker_id: &str,
        branch: &str,
        prompt: &str,
    ) -> ContainerSpec {
        let config = &self.config;
        let repo = config.repo_dir(&project.id);
        let worktree = config.worktree_dir(&project.id, worker_id);
        let logs = config.logs_dir(&project.id);
        let repo_str = repo.to_string_lossy().to_string();
        let worktree_str = worktree.to_string_lossy().to_string();

        let mut env = vec![
            ("TASK_ID".to_string(), task.id.clone()),
            ("TASK_TITLE".to_string(), task.title.clone()),
            ("TASK_DESC".to_string(), task.description.clone()),
            ("TASK_PLAN".to_string(), task.plan.clone().unwrap_or_default()),
            ("TASK_PROMPT".to_string(), prompt.to_string()),
            ("PROJECT_ID".to_string(), project.id.clone()),
            ("PROJECT_NAME".to_string(), project.name.clone()),
            ("WORKER_ID".to_string(), worker_id.to_string()),
            ("MANAGER_URL".to_string(), config.manager_url.clone()),
            ("BRANCH_NAME".to_string(), branch.to_string()),
        ];
        for (key, value) in [
            ("AGENT_API_KEY", &config.agent_api_key),
            ("AGENT_BASE_URL", &config.agent_base_url),
            ("AGENT_MODEL", &config.agent_model),
            ("HTTP_PROXY", &config.http_proxy),
            ("HTTPS_PROXY", &config.https_proxy),
            ("NO_PROXY", &config.no_proxy),
        ] {
            if let Some(value) = value {
                env.push((key.to_string(), value.clone()));
            }
        }

        ContainerSpec {
            name: format!("{}{}-{}", CONTAINER_PREFIX, worker_id, task.id),
            image: config.worker_image.clone(),
            env,
            binds: vec![
                Bind::rw(worktree_str.clone(), "/workspace"),
                // The worktree's gitdir pointer names the repo by absolute
                // path, so the repo mounts at that same path.
                Bind::rw(repo_str.clone(), repo_str),
                Bind::rw(logs.to_string_lossy().to_string(), "/logs"),
                // The pointer file itself is a separate read-only bind so
                // the agent cannot unlink it.
                Bind::ro(format!("{}/.git", worktree_str), "/workspace/.git"),
            ],
            memory_bytes: None,
            nano_cpus: None,
        }
    }

    async fn start_with_retry(&self, spec: ContainerSpec) -> Result<ContainerHandle, String> {
        match self.runtime.start(spec.clone()).await {
            Ok(handle) => Ok(handle),
            Err(first) => {
                eprintln!("[scheduler] container start failed, retrying once: {}", first);
                self.runtime
                    .start(spec)
                    .await
                    .map_err(|second| format!("container start failed: {}", second))
            }
        }
    }

    async fn spawn_log_forwarder(&self, worker_id: &str, handle: &ContainerHandle) {
        match self.runtime.logs(handle).await {
            Ok(mut stream) => {
                let events = Arc::clone(&self.events);
                let topic = log_topic(worker_id);
                tokio::spawn(async move {
                    let mut parser = LineParser::new();
                    while let Some(chunk) = stream.next().await {
                        for event in parser.feed(&chunk) {
                            if let Ok(value) = serde_json::to_value(&event) {
                                events.publish(&topic, value);
                            }
                        }
                    }
                    for event in parser.finish() {
                        if let Ok(value) = serde_json::to_value(&event) {
                            events.publish(&topic, value);
                        }
                    }
                });
            }
            Err(e) => eprintln!("[scheduler] log stream unavailable for {}: {}", worker_id, e),
        }
    }

    /// After container exit: give the status callback its grace window.
    /// Returns the task as last seen, or None if it vanished.
    async fn await_callback(
        &self,
        project_id: &str,
        task_id: &str,
        exit_code: i64,
    ) -> Option<Task> {
        let mut task = self.store.get_task(project_id, task_id).await.ok()?;
        if exit_code == 0 || !matches!(task.status, TaskStatus::Running | TaskStatus::Claimed) {
            return Some(task);
        }

        let grace = self.config.callback_grace;
        let poll = (grace / 10).clamp(Duration::from_millis(50), Duration::from_secs(2));
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(poll).await;
            task = self.store.get_task(project_id, task_id).await.ok()?;
            if !matches!(task.status, TaskStatus::Running | TaskStatus::Claimed) {
                return Some(task);
            }
        }
        // Exited non-zero and never reported.
        let _ = self
            .store
            .update_task(
                project_id,
                task_id,
                TaskPatch::failed("worker exited without status"),
            )
            .await;
        self.events.emit(
            "scheduler",
            format!("task {} failed: worker exited without status", task_id),
        );
        None
    }

    async fn fail_and_cleanup(
        &self,
        project_id: &str,
        task_id: &str,
        worker_id: &str,
        reason: &str,
        delete_branch: bool,
    ) {
        self.events
            .emit(worker_id, format!("task {} failed: {}", task_id, reason));
        if let Err(e) = self
            .store
            .update_task(project_id, task_id, TaskPatch::failed(reason))
            .await
        {
            eprintln!("[scheduler] cannot mark {} failed: {}", task_id, e);
        }
        let repo = self.config.repo_dir(project_id);
        let worktree = self.config.worktree_dir(project_id, worker_id);
        let branch = self.config.task_branch(task_id);
        self.cleanup_worktree(&repo, &worktree, &branch, delete_branch).await;
        self.pool.mark_idle(worker_id, false);
    }

    async fn cleanup_worktree(
        &self,
        repo: &Path,
        worktree: &Path,
        branch: &str,
        delete_branch: bool,
    ) {
        self.git.worktree_remove(repo, worktree).await;
        self.git.worktree_prune(repo).await;
        if delete_branch {
            self.git.delete_branch(repo, branch).await;
        }
    }
}

/// The prompt handed to the worker container: the task itself, the approved
/// plan, experience context, and the working-directory constraint.
fn compose_worker_prompt(task: &Task, recent: &str, cross: &str) -> String {
    let mut prompt = format!(
        "You are implementing a development task inside the directory /workspace. \
         Work only inside /workspace; never read or modify files outside it, and never \
         touch the `.git` file at its root.\n\n## Task: {}\n{}\n",
        task.title, task.description
    );
    if task.plan_approved
        && let Some(plan) = &task.plan
        && !plan.trim().is_empty()
    {
        prompt.push_str(&format!("\n## Approved plan\nFollow this plan:\n{}\n", plan));
    }
    if !recent.trim().is_empty() {
        prompt.push_str(&format!(
            "\n## Recent project history\nLessons from earlier tasks in this repository:\n{}\n",
            recent
        ));
    }
    if !cross.trim().is_empty() {
        prompt.push_str(&format!(
            "\n## Cross-project experience\n{}\n",
            cross
        ));
    }
    prompt.push_str(
        "\nWhen done, commit your work and report status through the callback described in AGENT.md.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use crate::models::{ProjectCreate, ProjectStatus, TaskCreate};
    use crate::runtime::MockRuntime;

    struct Fixture {
        _data: tempfile::TempDir,
        config: Arc<Config>,
        store: Store,
        events: Arc<EventBus>,
        runtime: Arc<MockRuntime>,
        scheduler: Scheduler,
        git: Git,
        project_id: String,
    }

    async fn fixture() -> Fixture {
        fixture_with(|config| config).await
    }

    async fn fixture_with(tune: impl Fn(Config) -> Config) -> Fixture {
        let data = tempfile::tempdir().unwrap();
        let config = Arc::new(tune(Config {
            data_dir: data.path().to_path_buf(),
            worker_count: 1,
            ..Config::default()
        }));
        let events = Arc::new(EventBus::new());
        let store = Store::new(Arc::clone(&config), Arc::clone(&events));
        let runtime = Arc::new(MockRuntime::new());
        let agent = Arc::new(MockAgent::new());
        let scheduler = Scheduler::new(
            Arc::clone(&config),
            store.clone(),
            Arc::clone(&events),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            agent as Arc<dyn Agent>,
        );

        let git = Git::new();
        let project = store
            .create_project(ProjectCreate {
                name: "demo".to_string(),
                repo_url: None,
                branch: "main".to_string(),
                source_type: "new".to_string(),
                auto_merge: true,
                auto_push: false,
            })
            .await
            .unwrap();
        let repo = config.repo_dir(&project.id);
        git.init_new(&repo).await.unwrap();
        tokio::fs::write(repo.join("README.md"), "# demo\n").await.unwrap();
        git.commit_all(&repo, "init").await.unwrap();
        store
            .update_project_status(&project.id, ProjectStatus::Ready, None)
            .await
            .unwrap();

        Fixture {
            _data: data,
            config,
            store,
            events,
            runtime,
            scheduler,
            git,
            project_id: project.id,
        }
    }

    async fn add_task(fx: &Fixture, description: &str) -> Task {
        fx.store
            .create_task(
                &fx.project_id,
                TaskCreate {
                    description: description.to_string(),
                    priority: 0,
                    depends_on: None,
                    plan_mode: false,
                },
            )
            .await
            .unwrap()
    }

    /// Simulates the worker container: commits work in the worktree and
    /// posts the merging callback, after a short delay.
    fn spawn_fake_worker(fx: &Fixture, task_id: String, delay: Duration) {
        let store = fx.store.clone();
        let config = Arc::clone(&fx.config);
        let project_id = fx.project_id.clone();
        let git = fx.git.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let worktree = config.worktree_dir(&project_id, "worker-1");
            tokio::fs::write(worktree.join("work.txt"), "done\n").await.unwrap();
            git.commit_all(&worktree, "do the work").await.unwrap();
            let commit = git.head_sha(&worktree).await.unwrap();
            store
                .update_task(
                    &project_id,
                    &task_id,
                    TaskPatch {
                        status: Some(TaskStatus::Merging),
                        commit_id: Some(Some(commit)),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        });
    }

    #[tokio::test]
    async fn test_happy_path_completes_and_cleans_up() {
        let fx = fixture().await;
        let task = add_task(&fx, "add README section explaining install").await;
        let (_, claimed) = fx.store.claim_next_task("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);

        fx.runtime.set_wait_delay(Duration::from_millis(400));
        fx.runtime.push_exit_code(0);
        spawn_fake_worker(&fx, task.id.clone(), Duration::from_millis(150));

        fx.scheduler
            .handle_task_direct("worker-1".to_string(), fx.project_id.clone(), claimed)
            .await;

        let done = fx.store.get_task(&fx.project_id, &task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed, "err={:?}", done.error);
        assert!(done.commit_id.is_some());
        assert!(done.completed_at.is_some());

        // Work landed on main; worktree and branch are gone.
        let repo = fx.config.repo_dir(&fx.project_id);
        assert!(repo.join("work.txt").exists());
        assert!(!fx.config.worktree_dir(&fx.project_id, "worker-1").exists());
        assert!(fx.git.list_branches(&repo, "agent/*").await.is_empty());

        // Experience entry was recorded and committed.
        let progress = tokio::fs::read_to_string(repo.join("PROGRESS.md")).await.unwrap();
        assert!(progress.contains(&task.title));

        // Dispatcher events narrate the lifecycle.
        let messages: Vec<String> = fx
            .events
            .recent(100)
            .into_iter()
            .map(|e| e.message)
            .collect();
        for needle in ["running", "merging", "completed"] {
            assert!(
                messages.iter().any(|m| m.contains(needle)),
                "missing '{}' in {:?}",
                needle,
                messages
            );
        }

        // Worker slot is free again and counted the completion.
        let workers = fx.scheduler.workers();
        assert_eq!(workers[0].status, WorkerStatus::Idle);
        assert_eq!(workers[0].tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_manual_merge_mode_parks_branch() {
        let fx = fixture().await;
        fx.store
            .update_project_settings(
                &fx.project_id,
                crate::models::ProjectSettingsUpdate {
                    auto_merge: Some(false),
                    auto_push: None,
                    task_timeout_secs: None,
                },
            )
            .await
            .unwrap();
        let task = add_task(&fx, "parked work").await;
        let (_, claimed) = fx.store.claim_next_task("worker-1").await.unwrap().unwrap();

        fx.runtime.set_wait_delay(Duration::from_millis(400));
        fx.runtime.push_exit_code(0);
        spawn_fake_worker(&fx, task.id.clone(), Duration::from_millis(150));

        fx.scheduler
            .handle_task_direct("worker-1".to_string(), fx.project_id.clone(), claimed)
            .await;

        let parked = fx.store.get_task(&fx.project_id, &task.id).await.unwrap();
        assert_eq!(parked.status, TaskStatus::MergePending, "err={:?}", parked.error);
        let repo = fx.config.repo_dir(&fx.project_id);
        // Branch kept for manual merge; worktree cleaned.
        assert_eq!(
            fx.git.list_branches(&repo, "agent/*").await,
            vec![fx.config.task_branch(&task.id)]
        );
        assert!(!fx.config.worktree_dir(&fx.project_id, "worker-1").exists());
        assert!(!repo.join("work.txt").exists(), "not merged into base yet");

        // Now the manual merge endpoint path.
        let commit = fx
            .scheduler
            .manual_merge(&fx.project_id, &task.id, false)
            .await
            .unwrap();
        assert_eq!(commit.len(), 40);
        let merged = fx.store.get_task(&fx.project_id, &task.id).await.unwrap();
        assert_eq!(merged.status, TaskStatus::Completed);
        assert!(repo.join("work.txt").exists());
        assert!(fx.git.list_branches(&repo, "agent/*").await.is_empty());
    }

    #[tokio::test]
    async fn test_worktree_pointer_corruption_fails_task() {
        let fx = fixture().await;
        let task = add_task(&fx, "evil task").await;
        let (_, claimed) = fx.store.claim_next_task("worker-1").await.unwrap().unwrap();

        fx.runtime.set_wait_delay(Duration::from_millis(300));
        fx.runtime.push_exit_code(0);
        // The "agent" destroys the pointer instead of doing work.
        let config = Arc::clone(&fx.config);
        let project_id = fx.project_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let link = config.worktree_dir(&project_id, "worker-1").join(".git");
            tokio::fs::write(&link, "gitdir: /somewhere/else").await.unwrap();
        });

        fx.scheduler
            .handle_task_direct("worker-1".to_string(), fx.project_id.clone(), claimed)
            .await;

        let failed = fx.store.get_task(&fx.project_id, &task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("worktree corruption"));
        assert!(!fx.config.worktree_dir(&fx.project_id, "worker-1").exists());
        let repo = fx.config.repo_dir(&fx.project_id);
        assert!(fx.git.list_branches(&repo, "agent/*").await.is_empty());
        assert_eq!(fx.scheduler.workers()[0].status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_exit_without_callback_fails_after_grace() {
        let fx = fixture_with(|mut config| {
            config.callback_grace = Duration::from_millis(300);
            config
        })
        .await;
        let task = add_task(&fx, "silent crash").await;
        let (_, claimed) = fx.store.claim_next_task("worker-1").await.unwrap().unwrap();

        // Non-zero exit, and no callback ever arrives.
        fx.runtime.push_exit_code(2);

        fx.scheduler
            .handle_task_direct("worker-1".to_string(), fx.project_id.clone(), claimed)
            .await;

        let failed = fx.store.get_task(&fx.project_id, &task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("worker exited without status"));
        // Worktree and branch were cleared.
        assert!(!fx.config.worktree_dir(&fx.project_id, "worker-1").exists());
    }

    #[tokio::test]
    async fn test_soft_timeout_stops_container() {
        let fx = fixture_with(|mut config| {
            config.task_timeout = Duration::from_millis(200);
            config
        })
        .await;
        let task = add_task(&fx, "runs forever").await;
        let (_, claimed) = fx.store.claim_next_task("worker-1").await.unwrap().unwrap();

        fx.runtime.set_wait_delay(Duration::from_secs(60));

        fx.scheduler
            .handle_task_direct("worker-1".to_string(), fx.project_id.clone(), claimed)
            .await;

        let failed = fx.store.get_task(&fx.project_id, &task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("exceeded 0 minutes"));
        assert_eq!(fx.runtime.stopped.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_task_stops_container() {
        let fx = fixture().await;
        let task = add_task(&fx, "to be cancelled").await;
        let (_, claimed) = fx.store.claim_next_task("worker-1").await.unwrap().unwrap();

        fx.runtime.set_wait_delay(Duration::from_secs(30));
        let scheduler = fx.scheduler.clone();
        let project_id = fx.project_id.clone();
        let job = tokio::spawn(async move {
            scheduler
                .handle_task_direct("worker-1".to_string(), project_id, claimed)
                .await;
        });
        // Let the container start.
        tokio::time::sleep(Duration::from_millis(300)).await;

        fx.scheduler
            .cancel_task(&fx.project_id, &task.id)
            .await
            .unwrap();
        let cancelled = fx.store.get_task(&fx.project_id, &task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(!fx.runtime.stopped.lock().unwrap().is_empty());
        job.abort();
    }

    #[tokio::test]
    async fn test_cancel_completed_task_is_conflict() {
        let fx = fixture().await;
        let task = add_task(&fx, "done already").await;
        let (_, claimed) = fx.store.claim_next_task("worker-1").await.unwrap().unwrap();
        for status in [TaskStatus::Running, TaskStatus::Merging, TaskStatus::Completed] {
            fx.store
                .update_task(&fx.project_id, &claimed.id, TaskPatch::status(status))
                .await
                .unwrap();
        }
        let err = fx
            .scheduler
            .cancel_task(&fx.project_id, &task.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_retry_resets_and_preserves_approved_plan() {
        let fx = fixture().await;
        let task = add_task(&fx, "flaky").await;
        fx.store
            .update_task(
                &fx.project_id,
                &task.id,
                TaskPatch {
                    plan: Some(Some("the plan".to_string())),
                    plan_approved: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let (_, claimed) = fx.store.claim_next_task("worker-1").await.unwrap().unwrap();
        fx.store
            .update_task(&fx.project_id, &claimed.id, TaskPatch::status(TaskStatus::Running))
            .await
            .unwrap();
        fx.store
            .update_task(&fx.project_id, &claimed.id, TaskPatch::failed("boom"))
            .await
            .unwrap();

        let retried = fx.scheduler.retry_task(&fx.project_id, &task.id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.worker_id, None);
        assert_eq!(retried.error, None);
        assert_eq!(retried.commit_id, None);
        assert_eq!(retried.plan.as_deref(), Some("the plan"));

        // Retry from pending is rejected.
        let err = fx.scheduler.retry_task(&fx.project_id, &task.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_worker_pool_reconcile() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.snapshot().len(), 3);

        pool.mark_busy("worker-2", "t-000001", "busy work");
        pool.reconcile(1);
        let workers = pool.snapshot();
        assert_eq!(workers[0].status, WorkerStatus::Idle);
        // Busy worker beyond the limit keeps running.
        assert_eq!(workers[1].status, WorkerStatus::Busy);
        assert_eq!(workers[2].status, WorkerStatus::Stopped);

        pool.reconcile(4);
        let workers = pool.snapshot();
        assert_eq!(workers.len(), 4);
        assert_eq!(workers[2].status, WorkerStatus::Idle);
        assert_eq!(workers[3].id, "worker-4");
    }

    #[tokio::test]
    async fn test_worker_count_zero_claims_nothing() {
        let fx = fixture_with(|mut config| {
            config.worker_count = 0;
            config
        })
        .await;
        add_task(&fx, "never claimed").await;

        let (tx, rx) = watch::channel(false);
        let scheduler = fx.scheduler.clone();
        let loop_handle = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        let _ = loop_handle.await;

        let tasks = fx.store.list_tasks(&fx.project_id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        // Cancel still works while the pool is empty.
        fx.scheduler
            .cancel_task(&fx.project_id, &tasks[0].id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_loop_drives_claim() {
        let fx = fixture().await;
        let task = add_task(&fx, "loop claimed").await;
        // The fake worker must commit before the container "exits".
        fx.runtime.set_wait_delay(Duration::from_millis(600));
        fx.runtime.push_exit_code(0);
        spawn_fake_worker(&fx, task.id.clone(), Duration::from_millis(200));

        let (tx, rx) = watch::channel(false);
        let scheduler = fx.scheduler.clone();
        let loop_handle = tokio::spawn(async move { scheduler.run(rx).await });

        // Wait for the lifecycle to finish.
        let mut status = TaskStatus::Pending;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            status = fx
                .store
                .get_task(&fx.project_id, &task.id)
                .await
                .unwrap()
                .status;
            if status == TaskStatus::Completed {
                break;
            }
        }
        tx.send(true).unwrap();
        let _ = loop_handle.await;
        assert_eq!(status, TaskStatus::Completed);

        let messages: Vec<String> = fx.events.recent(100).into_iter().map(|e| e.message).collect();
        assert!(messages.iter().any(|m| m.contains(&format!("claimed {} by worker-1", task.id))));
    }

    #[test]
    fn test_compose_worker_prompt_sections() {
        let mut task = Task::new(
            "t-000042".to_string(),
            TaskCreate {
                description: "implement the feature".to_string(),
                priority: 0,
                depends_on: None,
                plan_mode: true,
            },
        );
        task.plan = Some("1. step one".to_string());
        task.plan_approved = true;

        let prompt = compose_worker_prompt(&task, "## [x] past lesson\nbody", "[cross-project: other]\nentry");
        assert!(prompt.contains("/workspace"));
        assert!(prompt.contains("implement the feature"));
        assert!(prompt.contains("## Approved plan"));
        assert!(prompt.contains("1. step one"));
        assert!(prompt.contains("past lesson"));
        assert!(prompt.contains("cross-project"));

        // Unapproved plan stays out of the prompt.
        task.plan_approved = false;
        let prompt = compose_worker_prompt(&task, "", "");
        assert!(!prompt.contains("## Approved plan"));
    }
}
