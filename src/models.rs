//! Persisted data model: projects, tasks, workers, and the request payloads
//! that create or patch them.
//!
//! Everything here serializes to snake_case JSON. Status enums carry
//! `as_str`/`FromStr` pairs so the store, the REST layer, and the worker
//! callback all speak the same wire strings.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// UTC timestamp in ISO-8601, the format used throughout the store.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// 8-hex-char nonce used for project ids.
pub fn short_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Monotonic task id: `t-000123`.
pub fn task_id_from_seq(seq: u64) -> String {
    format!("t-{:06}", seq)
}

/// Derive a task title from its description: first line, max 50 chars.
pub fn derive_title(description: &str) -> String {
    let first = description.lines().next().unwrap_or("").trim();
    first.chars().take(50).collect()
}

// ── Projects ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Cloning,
    Ready,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloning => "cloning",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloning" => Ok(Self::Cloning),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// Where a project's repository comes from. Serialized with `source_type` as
/// the tag so the wire shape is `{"source_type":"git","repo_url":…}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source_type", rename_all = "snake_case")]
pub enum ProjectOrigin {
    Git { repo_url: String },
    Local { path: String },
    New,
}

impl ProjectOrigin {
    pub fn repo_url(&self) -> Option<&str> {
        match self {
            Self::Git { repo_url } => Some(repo_url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub origin: ProjectOrigin,
    /// Base branch task branches rebase onto and merge into. Detected from
    /// HEAD for local-path projects.
    #[serde(default = "default_branch")]
    pub branch: String,
    pub auto_merge: bool,
    pub auto_push: bool,
    pub status: ProjectStatus,
    #[serde(default)]
    pub error: Option<String>,
    /// Per-project override of the task soft timeout.
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
    pub created_at: String,
}

impl Project {
    pub fn new(create: ProjectCreate) -> Self {
        Self {
            id: short_nonce(),
            name: create.name.clone(),
            origin: create.origin(),
            branch: create.branch.clone(),
            auto_merge: create.auto_merge,
            auto_push: create.auto_push,
            status: ProjectStatus::Cloning,
            error: None,
            task_timeout_secs: None,
            created_at: now_iso(),
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_source_type() -> String {
    "git".to_string()
}

fn default_auto_merge() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectCreate {
    pub name: String,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_source_type")]
    pub source_type: String,
    #[serde(default = "default_auto_merge")]
    pub auto_merge: bool,
    #[serde(default)]
    pub auto_push: bool,
}

impl ProjectCreate {
    /// Fold the flat creation payload into a typed origin. In local mode the
    /// `repo_url` field carries the local path.
    pub fn origin(&self) -> ProjectOrigin {
        match self.source_type.as_str() {
            "local" => ProjectOrigin::Local {
                path: self.repo_url.clone().unwrap_or_default(),
            },
            "new" => ProjectOrigin::New,
            _ => ProjectOrigin::Git {
                repo_url: self.repo_url.clone().unwrap_or_default(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectSettingsUpdate {
    pub auto_merge: Option<bool>,
    pub auto_push: Option<bool>,
    pub task_timeout_secs: Option<u64>,
}

// ── Tasks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    PlanPending,
    PlanApproved,
    Merging,
    Testing,
    MergePending,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::PlanPending => "plan_pending",
            Self::PlanApproved => "plan_approved",
            Self::Merging => "merging",
            Self::Testing => "testing",
            Self::MergePending => "merge_pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses during which a task is bound to a worker.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Claimed | Self::Running | Self::Merging | Self::Testing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a task in this state may be reset to `pending` by retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::MergePending)
    }

    /// Legal forward edges of the task state machine, plus the two sanctioned
    /// backward edges (retry and plan rejection). Same-status writes are
    /// idempotent no-ops and always allowed.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if from == to {
            return true;
        }
        match (from, to) {
            (Pending, Claimed | PlanPending | Cancelled) => true,
            (PlanPending, PlanApproved | Pending | Failed | Cancelled) => true,
            (PlanApproved, Claimed | Cancelled) => true,
            (Claimed, Running | Failed | Cancelled) => true,
            (Running, Merging | Failed | Cancelled) => true,
            (Merging, Testing | Completed | MergePending | Failed | Cancelled) => true,
            (Testing, Merging | Completed | MergePending | Failed | Cancelled) => true,
            (MergePending, Completed | Cancelled) => true,
            (Failed, Cancelled) => true,
            // Retry resets.
            (Failed | Cancelled | MergePending, Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "plan_pending" => Ok(Self::PlanPending),
            "plan_approved" => Ok(Self::PlanApproved),
            "merging" => Ok(Self::Merging),
            "testing" => Ok(Self::Testing),
            "merge_pending" => Ok(Self::MergePending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// One turn of a plan-refinement conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

impl PlanMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            timestamp: now_iso(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            timestamp: now_iso(),
        }
    }
}

/// A multiple-choice clarification question attached to a generated plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanQuestion {
    pub key: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i32,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default)]
    pub plan_approved: bool,
    #[serde(default)]
    pub plan_questions: Option<Vec<PlanQuestion>>,
    #[serde(default)]
    pub plan_answers: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub plan_messages: Option<Vec<PlanMessage>>,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub commit_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl Task {
    pub fn new(id: String, create: TaskCreate) -> Self {
        Self {
            id,
            title: derive_title(&create.description),
            description: create.description,
            status: TaskStatus::Pending,
            priority: create.priority,
            worker_id: None,
            branch: None,
            plan: None,
            plan_mode: create.plan_mode,
            plan_approved: false,
            plan_questions: None,
            plan_answers: None,
            plan_messages: None,
            depends_on: create.depends_on,
            commit_id: None,
            error: None,
            created_at: now_iso(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskCreate {
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub plan_mode: bool,
}

/// Partial update applied to a task under the store lock. `None` fields are
/// left untouched; status changes are validated against the state machine.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub worker_id: Option<Option<String>>,
    pub branch: Option<Option<String>>,
    pub plan: Option<Option<String>>,
    pub plan_approved: Option<bool>,
    pub plan_questions: Option<Option<Vec<PlanQuestion>>>,
    pub plan_answers: Option<Option<serde_json::Map<String, serde_json::Value>>>,
    pub plan_messages: Option<Option<Vec<PlanMessage>>>,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub commit_id: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub started_at: Option<Option<String>>,
    pub completed_at: Option<Option<String>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(Some(reason.into())),
            ..Default::default()
        }
    }
}

// ── Workers ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopped,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid worker status: {}", s)),
        }
    }
}

/// One container slot. Not persisted; rebuilt at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: String,
    #[serde(default)]
    pub container_id: Option<String>,
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub current_task_title: Option<String>,
    pub tasks_completed: u64,
    #[serde(default)]
    pub last_activity: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
}

impl WorkerState {
    pub fn idle(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            container_id: None,
            status: WorkerStatus::Idle,
            current_task_id: None,
            current_task_title: None,
            tasks_completed: 0,
            last_activity: None,
            started_at: Some(now_iso()),
        }
    }
}

// ── Dispatcher events ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherEvent {
    pub ts: String,
    pub source: String,
    pub message: String,
}

impl DispatcherEvent {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ts: now_iso(),
            source: source.into(),
            message: message.into(),
        }
    }
}

// ── Stats ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub merge_pending: usize,
    pub success_rate: Option<f64>,
    pub avg_duration_seconds: Option<f64>,
    pub failure_reasons: std::collections::HashMap<String, u32>,
}

impl ProjectStats {
    pub fn compute(tasks: &[Task]) -> Self {
        use TaskStatus::*;
        let total = tasks.len();
        let completed = tasks.iter().filter(|t| t.status == Completed).count();
        let failed = tasks.iter().filter(|t| t.status == Failed).count();
        let cancelled = tasks.iter().filter(|t| t.status == Cancelled).count();
        let in_progress = tasks.iter().filter(|t| t.status.is_active()).count();
        let pending = tasks
            .iter()
            .filter(|t| matches!(t.status, Pending | PlanPending | PlanApproved))
            .count();
        let merge_pending = tasks.iter().filter(|t| t.status == MergePending).count();

        let finished = completed + failed;
        let success_rate = if finished > 0 {
            Some((completed as f64 / finished as f64 * 1000.0).round() / 10.0)
        } else {
            None
        };

        let mut durations = Vec::new();
        for t in tasks {
            if t.status == Completed
                && let (Some(start), Some(end)) = (&t.started_at, &t.completed_at)
                && let (Ok(start), Ok(end)) = (
                    chrono::DateTime::parse_from_rfc3339(start),
                    chrono::DateTime::parse_from_rfc3339(end),
                )
            {
                durations.push((end - start).num_milliseconds() as f64 / 1000.0);
            }
        }
        let avg_duration_seconds = if durations.is_empty() {
            None
        } else {
            Some((durations.iter().sum::<f64>() / durations.len() as f64 * 10.0).round() / 10.0)
        };

        let mut failure_reasons: std::collections::HashMap<String, u32> =
            std::collections::HashMap::new();
        for t in tasks {
            if t.status == Failed
                && let Some(err) = &t.error
            {
                let key: String = err.chars().take(80).collect();
                *failure_reasons.entry(key).or_insert(0) += 1;
            }
        }

        Self {
            total,
            completed,
            failed,
            cancelled,
            in_progress,
            pending,
            merge_pending,
            success_rate,
            avg_duration_seconds,
            failure_reasons,
        }
    }
}
