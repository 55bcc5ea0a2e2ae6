//! Engine configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Branch namespace for task branches: `agent/<task-id>`.
pub const BRANCH_PREFIX: &str = "agent";

/// Name of the agent-instructions file injected into repos and worktrees.
/// Excluded from git tracking; never committed.
pub const INSTRUCTIONS_FILE: &str = "AGENT.md";

/// Name of the per-repository experience log.
pub const PROGRESS_FILE: &str = "PROGRESS.md";

/// Ground rules injected into every repo and worktree as `AGENT.md`.
pub const INSTRUCTIONS_TEMPLATE: &str = "\
# Worker instructions

- Your working directory is the task worktree. Never read or write outside it.
- Never modify or delete the `.git` file at the worktree root.
- Commit your work with clear messages; leave the tree clean when you finish.
- Report status changes by POSTing to
  `$MANAGER_URL/api/internal/tasks/$PROJECT_ID/$TASK_ID/status`
  with JSON `{\"status\": \"merging\", \"commit\": \"<sha>\", \"branch\": \"$BRANCH_NAME\"}`
  on success, or `{\"status\": \"failed\", \"error\": \"<reason>\"}` on failure.
- Exit 0 only when a commit is ready to merge.
";

#[derive(Debug, Clone)]
pub struct Config {
    pub worker_count: usize,
    pub port: u16,
    pub data_dir: PathBuf,
    pub worker_image: String,
    pub agent_cmd: String,
    pub agent_api_key: Option<String>,
    pub agent_base_url: Option<String>,
    pub agent_model: Option<String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub manager_url: String,
    pub task_timeout: Duration,
    pub plan_timeout: Duration,
    /// How long a status callback may trail a container exit.
    pub callback_grace: Duration,
    pub local_repos_root: PathBuf,
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 3,
            port: 8420,
            data_dir: PathBuf::from("./data"),
            worker_image: "shipyard-worker:latest".to_string(),
            agent_cmd: "claude".to_string(),
            agent_api_key: None,
            agent_base_url: None,
            agent_model: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
            manager_url: "http://host.docker.internal:8420".to_string(),
            task_timeout: Duration::from_secs(1800),
            plan_timeout: Duration::from_secs(300),
            callback_grace: Duration::from_secs(30),
            local_repos_root: PathBuf::from("/mnt/repos"),
            dev_mode: false,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_var("WORKER_COUNT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.worker_count),
            port: env_var("WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            data_dir: env_var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            worker_image: env_var("WORKER_IMAGE").unwrap_or(defaults.worker_image),
            agent_cmd: env_var("AGENT_CMD").unwrap_or(defaults.agent_cmd),
            agent_api_key: env_var("AGENT_API_KEY"),
            agent_base_url: env_var("AGENT_BASE_URL"),
            agent_model: env_var("AGENT_MODEL"),
            http_proxy: env_var("HTTP_PROXY"),
            https_proxy: env_var("HTTPS_PROXY"),
            no_proxy: env_var("NO_PROXY"),
            manager_url: env_var("MANAGER_URL").unwrap_or(defaults.manager_url),
            task_timeout: env_var("TASK_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_timeout),
            plan_timeout: env_var("PLAN_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.plan_timeout),
            callback_grace: defaults.callback_grace,
            local_repos_root: env_var("LOCAL_REPOS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_repos_root),
            dev_mode: env_var("SHIPYARD_DEV").is_some_and(|v| v == "1" || v == "true"),
        }
    }

    // Path helpers. The on-disk layout is:
    //   data/projects.json
    //   data/projects/<pid>/tasks.json
    //   data/projects/<pid>/repo/
    //   data/projects/<pid>/worktrees/<wid>/
    //   data/projects/<pid>/logs/<wid>.jsonl

    pub fn registry_file(&self) -> PathBuf {
        self.data_dir.join("projects.json")
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.data_dir.join("projects").join(project_id)
    }

    pub fn tasks_file(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("tasks.json")
    }

    pub fn repo_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("repo")
    }

    pub fn worktrees_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("worktrees")
    }

    pub fn worktree_dir(&self, project_id: &str, worker_id: &str) -> PathBuf {
        self.worktrees_dir(project_id).join(worker_id)
    }

    pub fn logs_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("logs")
    }

    pub fn worker_log_file(&self, project_id: &str, worker_id: &str) -> PathBuf {
        self.logs_dir(project_id).join(format!("{}.jsonl", worker_id))
    }

    pub fn task_branch(&self, task_id: &str) -> String {
        format!("{}/{}", BRANCH_PREFIX, task_id)
    }
}
