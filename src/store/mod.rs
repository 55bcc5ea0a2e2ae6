//! Directory-backed registry for projects and tasks.
//!
//! Layout on disk:
//! ```text
//! data/projects.json                      # project registry + task id counter
//! data/projects/<pid>/tasks.json          # per-project task queue
//! data/projects/<pid>/repo/               # git repository
//! data/projects/<pid>/worktrees/<wid>/    # task worktrees
//! data/projects/<pid>/logs/<wid>.jsonl    # per-worker agent log
//! ```
//!
//! Every JSON file is guarded by an exclusive advisory lock on a sibling
//! `.lock` file, held only for the duration of a read-modify-write. Writes go
//! to a temp file and are renamed into place. Cross-file operations (the
//! cross-project claim) take the registry lock first and then each project's
//! task lock in project-id order, so no two lock orders can deadlock.
//!
//! All public methods are async and run their lock-holding section inside
//! `spawn_blocking`; no store lock is ever held across an await point.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::StoreError;
use crate::events::EventBus;
use crate::models::{
    now_iso, task_id_from_seq, Project, ProjectCreate, ProjectSettingsUpdate, ProjectStatus, Task,
    TaskCreate, TaskPatch, TaskStatus,
};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Cap applied when stale recovery boosts a task's priority.
const RECOVERY_PRIORITY_CAP: i32 = 100;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    next_task_seq: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskQueue {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Exclusive advisory lock on `<path>.lock`. Released on drop.
struct FileGuard {
    file: File,
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn acquire_lock(target: &Path) -> Result<FileGuard, StoreError> {
    let lock_path = PathBuf::from(format!("{}.lock", target.display()));
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|source| StoreError::Io {
            path: lock_path.clone(),
            source,
        })?;

    let started = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(FileGuard { file }),
            Err(_) if started.elapsed() < LOCK_TIMEOUT => {
                std::thread::sleep(LOCK_RETRY);
            }
            Err(_) => {
                return Err(StoreError::LockTimeout {
                    path: lock_path,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }
}

/// Read a JSON file, tolerating absence. A malformed file is quarantined:
/// renamed to `<name>.corrupt-<unix-ts>` and replaced by the default value,
/// with a `system` dispatcher event.
fn read_or_quarantine<T: Default + for<'de> Deserialize<'de>>(
    path: &Path,
    events: &EventBus,
) -> Result<T, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    match serde_json::from_slice(&data) {
        Ok(value) => Ok(value),
        Err(_) => {
            let quarantined = PathBuf::from(format!(
                "{}.corrupt-{}",
                path.display(),
                chrono::Utc::now().timestamp()
            ));
            let _ = fs::rename(path, &quarantined);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            events.emit("system", format!("quarantined {}", name));
            eprintln!("[store] quarantined malformed {}", path.display());
            Ok(T::default())
        }
    }
}

/// Atomic write: temp file in the same directory, fsync, rename into place.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|source| StoreError::Io {
        path: parent.to_path_buf(),
        source,
    })?;
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let io_err = |source| StoreError::Io {
        path: tmp.clone(),
        source,
    };
    let mut file = File::create(&tmp).map_err(io_err)?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::Other(anyhow::anyhow!("serialize {}: {}", path.display(), e)))?;
    file.write_all(&data).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&tmp, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Claim eligibility ordering: approved plans first, then priority (higher
/// wins), then creation time, then task id.
fn claim_sort_key(task: &Task) -> (u8, i32, String, String) {
    let status_rank = if task.status == TaskStatus::PlanApproved { 0 } else { 1 };
    (
        status_rank,
        -task.priority,
        task.created_at.clone(),
        task.id.clone(),
    )
}

#[derive(Clone)]
pub struct Store {
    config: Arc<Config>,
    events: Arc<EventBus>,
}

impl Store {
    pub fn new(config: Arc<Config>, events: Arc<EventBus>) -> Self {
        Self { config, events }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Config>, Arc<EventBus>) -> Result<T, StoreError> + Send + 'static,
    {
        let config = Arc::clone(&self.config);
        let events = Arc::clone(&self.events);
        tokio::task::spawn_blocking(move || f(config, events))
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!("store task panicked: {}", e)))?
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        self.blocking(|config, events| {
            let registry_file = config.registry_file();
            let _guard = acquire_lock(&registry_file)?;
            let registry: Registry = read_or_quarantine(&registry_file, &events)?;
            Ok(registry.projects)
        })
        .await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project, StoreError> {
        let pid = project_id.to_string();
        self.blocking(move |config, events| {
            let registry_file = config.registry_file();
            let _guard = acquire_lock(&registry_file)?;
            let registry: Registry = read_or_quarantine(&registry_file, &events)?;
            registry
                .projects
                .into_iter()
                .find(|p| p.id == pid)
                .ok_or_else(|| StoreError::not_found("project", pid))
        })
        .await
    }

    /// Register a project and create its directory skeleton. The repository
    /// itself is populated asynchronously by the supervisor's clone job.
    pub async fn create_project(&self, create: ProjectCreate) -> Result<Project, StoreError> {
        self.blocking(move |config, events| {
            let registry_file = config.registry_file();
            let _guard = acquire_lock(&registry_file)?;
            let mut registry: Registry = read_or_quarantine(&registry_file, &events)?;
            let project = Project::new(create);
            registry.projects.push(project.clone());
            write_json(&registry_file, &registry)?;

            for dir in ["repo", "logs", "worktrees"] {
                let path = config.project_dir(&project.id).join(dir);
                fs::create_dir_all(&path).map_err(|source| StoreError::Io { path, source })?;
            }
            let tasks_file = config.tasks_file(&project.id);
            if !tasks_file.exists() {
                write_json(&tasks_file, &TaskQueue::default())?;
            }
            Ok(project)
        })
        .await
    }

    pub async fn update_project_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
        error: Option<String>,
    ) -> Result<Project, StoreError> {
        let pid = project_id.to_string();
        self.mutate_project(pid, move |p| {
            p.status = status;
            p.error = error.clone();
        })
        .await
    }

    pub async fn update_project_settings(
        &self,
        project_id: &str,
        update: ProjectSettingsUpdate,
    ) -> Result<Project, StoreError> {
        let pid = project_id.to_string();
        self.mutate_project(pid, move |p| {
            if let Some(auto_merge) = update.auto_merge {
                p.auto_merge = auto_merge;
            }
            if let Some(auto_push) = update.auto_push {
                p.auto_push = auto_push;
            }
            if let Some(task_timeout_secs) = update.task_timeout_secs {
                p.task_timeout_secs = Some(task_timeout_secs);
            }
        })
        .await
    }

    /// Record the detected base branch of a local-path project.
    pub async fn set_project_branch(
        &self,
        project_id: &str,
        branch: &str,
    ) -> Result<Project, StoreError> {
        let pid = project_id.to_string();
        let branch = branch.to_string();
        self.mutate_project(pid, move |p| {
            p.branch = branch.clone();
        })
        .await
    }

    async fn mutate_project<F>(&self, project_id: String, f: F) -> Result<Project, StoreError>
    where
        F: FnOnce(&mut Project) + Send + 'static,
    {
        self.blocking(move |config, events| {
            let registry_file = config.registry_file();
            let _guard = acquire_lock(&registry_file)?;
            let mut registry: Registry = read_or_quarantine(&registry_file, &events)?;
            let project = registry
                .projects
                .iter_mut()
                .find(|p| p.id == project_id)
                .ok_or_else(|| StoreError::not_found("project", project_id.clone()))?;
            f(project);
            let updated = project.clone();
            write_json(&registry_file, &registry)?;
            Ok(updated)
        })
        .await
    }

    /// Remove a project from the registry and delete its directory tree,
    /// cascading task deletion. Returns false for an unknown id.
    pub async fn delete_project(&self, project_id: &str) -> Result<bool, StoreError> {
        let pid = project_id.to_string();
        self.blocking(move |config, events| {
            let registry_file = config.registry_file();
            let removed = {
                let _guard = acquire_lock(&registry_file)?;
                let mut registry: Registry = read_or_quarantine(&registry_file, &events)?;
                let before = registry.projects.len();
                registry.projects.retain(|p| p.id != pid);
                if registry.projects.len() == before {
                    false
                } else {
                    write_json(&registry_file, &registry)?;
                    true
                }
            };
            if removed {
                let dir = config.project_dir(&pid);
                if dir.exists() {
                    let _ = fs::remove_dir_all(&dir);
                }
            }
            Ok(removed)
        })
        .await
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>, StoreError> {
        let pid = project_id.to_string();
        self.blocking(move |config, events| {
            let tasks_file = config.tasks_file(&pid);
            let _guard = acquire_lock(&tasks_file)?;
            let queue: TaskQueue = read_or_quarantine(&tasks_file, &events)?;
            Ok(queue.tasks)
        })
        .await
    }

    pub async fn get_task(&self, project_id: &str, task_id: &str) -> Result<Task, StoreError> {
        let pid = project_id.to_string();
        let tid = task_id.to_string();
        self.blocking(move |config, events| {
            let tasks_file = config.tasks_file(&pid);
            let _guard = acquire_lock(&tasks_file)?;
            let queue: TaskQueue = read_or_quarantine(&tasks_file, &events)?;
            queue
                .tasks
                .into_iter()
                .find(|t| t.id == tid)
                .ok_or_else(|| StoreError::not_found("task", tid))
        })
        .await
    }

    /// Append a task. The id is allocated from the registry's monotonic
    /// counter under the registry lock, so ids are unique store-wide.
    pub async fn create_task(
        &self,
        project_id: &str,
        create: TaskCreate,
    ) -> Result<Task, StoreError> {
        let pid = project_id.to_string();
        self.blocking(move |config, events| {
            let registry_file = config.registry_file();
            let task_id = {
                let _guard = acquire_lock(&registry_file)?;
                let mut registry: Registry = read_or_quarantine(&registry_file, &events)?;
                if !registry.projects.iter().any(|p| p.id == pid) {
                    return Err(StoreError::not_found("project", pid.clone()));
                }
                registry.next_task_seq += 1;
                let id = task_id_from_seq(registry.next_task_seq);
                write_json(&registry_file, &registry)?;
                id
            };

            let tasks_file = config.tasks_file(&pid);
            let _guard = acquire_lock(&tasks_file)?;
            let mut queue: TaskQueue = read_or_quarantine(&tasks_file, &events)?;
            let task = Task::new(task_id, create);
            queue.tasks.push(task.clone());
            write_json(&tasks_file, &queue)?;
            Ok(task)
        })
        .await
    }

    /// Apply a partial update. A status change is validated against the task
    /// state machine first; an illegal edge fails `Conflict` and leaves the
    /// file untouched. The worker binding invariant (worker_id set iff the
    /// task is in an active status) is enforced here.
    pub async fn update_task(
        &self,
        project_id: &str,
        task_id: &str,
        patch: TaskPatch,
    ) -> Result<Task, StoreError> {
        let pid = project_id.to_string();
        let tid = task_id.to_string();
        self.blocking(move |config, events| {
            let tasks_file = config.tasks_file(&pid);
            let _guard = acquire_lock(&tasks_file)?;
            let mut queue: TaskQueue = read_or_quarantine(&tasks_file, &events)?;
            let task = queue
                .tasks
                .iter_mut()
                .find(|t| t.id == tid)
                .ok_or_else(|| StoreError::not_found("task", tid))?;

            if let Some(to) = patch.status
                && !TaskStatus::can_transition(task.status, to)
            {
                return Err(StoreError::Conflict {
                    from: task.status,
                    to,
                });
            }

            apply_patch(task, patch);
            let updated = task.clone();
            write_json(&tasks_file, &queue)?;
            Ok(updated)
        })
        .await
    }

    pub async fn delete_task(&self, project_id: &str, task_id: &str) -> Result<bool, StoreError> {
        let pid = project_id.to_string();
        let tid = task_id.to_string();
        self.blocking(move |config, events| {
            let tasks_file = config.tasks_file(&pid);
            let _guard = acquire_lock(&tasks_file)?;
            let mut queue: TaskQueue = read_or_quarantine(&tasks_file, &events)?;
            let before = queue.tasks.len();
            queue.tasks.retain(|t| t.id != tid);
            if queue.tasks.len() == before {
                return Ok(false);
            }
            write_json(&tasks_file, &queue)?;
            Ok(true)
        })
        .await
    }

    // ── Cross-project operations ──────────────────────────────────────

    /// Atomically select and claim the best eligible task across all ready
    /// projects. Linearizable: the registry lock is held for the whole scan,
    /// and project task files are locked one at a time in project-id order.
    pub async fn claim_next_task(
        &self,
        worker_id: &str,
    ) -> Result<Option<(String, Task)>, StoreError> {
        let wid = worker_id.to_string();
        self.blocking(move |config, events| {
            let registry_file = config.registry_file();
            let _registry_guard = acquire_lock(&registry_file)?;
            let registry: Registry = read_or_quarantine(&registry_file, &events)?;

            let mut ready: Vec<&Project> = registry
                .projects
                .iter()
                .filter(|p| p.status == ProjectStatus::Ready)
                .collect();
            ready.sort_by(|a, b| a.id.cmp(&b.id));

            let mut candidates: Vec<(String, Task)> = Vec::new();
            for project in &ready {
                let tasks_file = config.tasks_file(&project.id);
                let _guard = match acquire_lock(&tasks_file) {
                    Ok(guard) => guard,
                    Err(StoreError::LockTimeout { .. }) => continue,
                    Err(e) => return Err(e),
                };
                let queue: TaskQueue = read_or_quarantine(&tasks_file, &events)?;
                let completed: HashSet<&str> = queue
                    .tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Completed)
                    .map(|t| t.id.as_str())
                    .collect();
                for task in &queue.tasks {
                    let eligible = matches!(
                        task.status,
                        TaskStatus::Pending | TaskStatus::PlanApproved
                    );
                    if !eligible {
                        continue;
                    }
                    if let Some(dep) = &task.depends_on
                        && !completed.contains(dep.as_str())
                    {
                        continue;
                    }
                    candidates.push((project.id.clone(), task.clone()));
                }
            }

            candidates.sort_by_key(|(_, t)| claim_sort_key(t));
            let Some((pid, chosen)) = candidates.into_iter().next() else {
                return Ok(None);
            };

            let tasks_file = config.tasks_file(&pid);
            let _guard = acquire_lock(&tasks_file)?;
            let mut queue: TaskQueue = read_or_quarantine(&tasks_file, &events)?;
            let Some(task) = queue
                .tasks
                .iter_mut()
                .find(|t| t.id == chosen.id && t.status == chosen.status)
            else {
                // Raced with a delete or out-of-band status change; the next
                // tick will pick another candidate.
                return Ok(None);
            };
            task.status = TaskStatus::Claimed;
            task.worker_id = Some(wid);
            task.started_at = Some(now_iso());
            task.error = None;
            let claimed = task.clone();
            write_json(&tasks_file, &queue)?;
            Ok(Some((pid, claimed)))
        })
        .await
    }

    /// Return tasks stuck in intermediate states to `pending`, boosting their
    /// priority by one. `live_workers` holds ids of workers whose container
    /// is still alive (normally empty after a restart); their tasks are left
    /// alone. Returns `(project_id, task_id)` of every recovered task.
    pub async fn recover_stale(
        &self,
        live_workers: HashSet<String>,
    ) -> Result<Vec<(String, String)>, StoreError> {
        self.blocking(move |config, events| {
            let registry_file = config.registry_file();
            let _registry_guard = acquire_lock(&registry_file)?;
            let registry: Registry = read_or_quarantine(&registry_file, &events)?;

            let mut recovered = Vec::new();
            for project in &registry.projects {
                let tasks_file = config.tasks_file(&project.id);
                let _guard = match acquire_lock(&tasks_file) {
                    Ok(guard) => guard,
                    Err(_) => continue,
                };
                let mut queue: TaskQueue = read_or_quarantine(&tasks_file, &events)?;
                let mut changed = false;
                for task in &mut queue.tasks {
                    if !task.status.is_active() {
                        continue;
                    }
                    if let Some(wid) = &task.worker_id
                        && live_workers.contains(wid)
                    {
                        continue;
                    }
                    task.status = TaskStatus::Pending;
                    task.worker_id = None;
                    task.error = None;
                    task.priority = (task.priority + 1).min(RECOVERY_PRIORITY_CAP);
                    recovered.push((project.id.clone(), task.id.clone()));
                    changed = true;
                }
                if changed {
                    write_json(&tasks_file, &queue)?;
                }
            }
            Ok(recovered)
        })
        .await
    }
}

fn apply_patch(task: &mut Task, patch: TaskPatch) {
    if let Some(status) = patch.status {
        task.status = status;
        if status == TaskStatus::Completed {
            task.completed_at = Some(now_iso());
        }
        if !status.is_active() {
            task.worker_id = None;
        }
    }
    if let Some(worker_id) = patch.worker_id {
        task.worker_id = worker_id;
    }
    if let Some(branch) = patch.branch {
        task.branch = branch;
    }
    if let Some(plan) = patch.plan {
        task.plan = plan;
    }
    if let Some(plan_approved) = patch.plan_approved {
        task.plan_approved = plan_approved;
    }
    if let Some(plan_questions) = patch.plan_questions {
        task.plan_questions = plan_questions;
    }
    if let Some(plan_answers) = patch.plan_answers {
        task.plan_answers = plan_answers;
    }
    if let Some(plan_messages) = patch.plan_messages {
        task.plan_messages = plan_messages;
    }
    if let Some(description) = patch.description {
        task.description = description;
    }
    if let Some(priority) = patch.priority {
        task.priority = priority;
    }
    if let Some(commit_id) = patch.commit_id {
        task.commit_id = commit_id;
    }
    if let Some(error) = patch.error {
        task.error = error;
    }
    if let Some(started_at) = patch.started_at {
        task.started_at = started_at;
    }
    if let Some(completed_at) = patch.completed_at {
        task.completed_at = completed_at;
    }
}
