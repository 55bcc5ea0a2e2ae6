//! The per-repository experience log (`PROGRESS.md`).
//!
//! Every completed task appends a structured entry — problem, solution,
//! prevention — distilled from the worker's log by a short agent reflection
//! call. Before launching a new task, the most recent entries (and, across
//! projects, lexically similar ones) are folded into the worker prompt so
//! future runs inherit the lessons.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{Agent, AgentRequest};
use crate::config::PROGRESS_FILE;
use crate::git::Git;
use crate::stream::parse_jsonl;

/// Bytes of `PROGRESS.md` read from the tail when retrieving entries.
const READ_BUDGET: usize = 12 * 1024;
/// Bytes of retrieved entries allowed into the worker prompt.
const PROMPT_BUDGET: usize = 3 * 1024;
const RECENT_ENTRIES: usize = 5;

/// Cross-project retrieval bounds.
const CROSS_BUDGET: usize = 2500;
const CROSS_ENTRIES: usize = 3;

/// Cap on the log excerpt fed to the reflection call.
const LOG_SUMMARY_BUDGET: usize = 4000;
const REFLECTION_TIMEOUT: Duration = Duration::from_secs(60);

const PROGRESS_HEADER: &str =
    "# Development Progress\n\nAutomatically maintained by worker agents.\n\n---\n";

pub struct CompletionRecord<'a> {
    pub task_id: &'a str,
    pub task_title: &'a str,
    pub worker_id: &'a str,
    pub commit_id: &'a str,
    pub log_file: &'a Path,
}

pub struct ExperienceIndexer {
    agent: Arc<dyn Agent>,
    git: Git,
}

impl ExperienceIndexer {
    pub fn new(agent: Arc<dyn Agent>, git: Git) -> Self {
        Self { agent, git }
    }

    /// Ensure `PROGRESS.md` exists with its header.
    pub async fn ensure_progress_file(repo_dir: &Path) -> std::io::Result<()> {
        let path = repo_dir.join(PROGRESS_FILE);
        if !path.exists() {
            tokio::fs::write(&path, PROGRESS_HEADER).await?;
        }
        Ok(())
    }

    /// Derive a structured entry from the completion log, append it to the
    /// repository's `PROGRESS.md`, and commit it so history propagates with
    /// merges. Best-effort: failures are logged, never fatal to the task.
    pub async fn record_completion(&self, repo_dir: &Path, record: CompletionRecord<'_>) {
        let log_summary = extract_log_summary(record.log_file).await;
        let reflection = self.reflect(repo_dir, &record, &log_summary).await;
        let entry = format_entry(&record, &reflection);

        if let Err(e) = Self::ensure_progress_file(repo_dir).await {
            eprintln!("[experience] cannot create progress file: {}", e);
            return;
        }
        let path = repo_dir.join(PROGRESS_FILE);
        let mut content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        content.push_str(&entry);
        if let Err(e) = tokio::fs::write(&path, content).await {
            eprintln!("[experience] cannot append progress entry: {}", e);
            return;
        }

        if let Err(e) = self.git.add(repo_dir, PROGRESS_FILE).await {
            eprintln!("[experience] git add failed: {}", e.excerpt());
            return;
        }
        if let Err(e) = self
            .git
            .commit(
                repo_dir,
                &format!("docs: log experience for task {}", record.task_id),
            )
            .await
        {
            // Nothing staged (duplicate run) is normal; other failures get
            // surfaced.
            eprintln!("[experience] commit skipped: {}", e.excerpt());
        }
    }

    async fn reflect(
        &self,
        repo_dir: &Path,
        record: &CompletionRecord<'_>,
        log_summary: &str,
    ) -> String {
        let fallback = "- **Problem**: N/A\n- **Solution**: Task completed without notable issues.\n- **Prevention**: N/A".to_string();
        if log_summary.trim().is_empty() {
            return fallback;
        }

        let prompt = format!(
            "Analyze this task completion log and produce a structured experience entry.\n\n\
             Task: {} (ID: {})\n\nWorker log (last messages):\n{}\n\n\
             Respond with ONLY a markdown block in this exact format (no extra text):\n\n\
             - **Problem**: One sentence on the main challenge encountered (or \"No significant issues\")\n\
             - **Solution**: One sentence on how it was resolved\n\
             - **Prevention**: One sentence on how future tasks avoid it (or \"N/A\")\n\
             - **Key files**: Comma-separated list of the main files modified",
            record.task_title, record.task_id, log_summary
        );

        match self
            .agent
            .run(AgentRequest::new(repo_dir, prompt, REFLECTION_TIMEOUT))
            .await
        {
            Ok(run) if run.success && !run.text.trim().is_empty() => run.text.trim().to_string(),
            _ => fallback,
        }
    }

    /// The last few structured entries of a project's own `PROGRESS.md`,
    /// bounded both by entry count and by byte budgets.
    pub async fn recent_entries(&self, repo_dir: &Path) -> String {
        let content = read_tail(&repo_dir.join(PROGRESS_FILE), READ_BUDGET).await;
        let entries = split_entries(&content);
        let start = entries.len().saturating_sub(RECENT_ENTRIES);
        let joined = entries[start..].join("\n");
        truncate_tail(&joined, PROMPT_BUDGET)
    }

    /// Search other projects' progress files for entries lexically close to
    /// the task at hand. Returns up to three labeled snippets.
    pub async fn cross_project(
        &self,
        others: &[(String, PathBuf)],
        task_title: &str,
        task_description: &str,
    ) -> String {
        let query = token_set(&format!("{} {}", task_title, task_description));
        if query.is_empty() {
            return String::new();
        }

        let mut scored: Vec<(usize, String)> = Vec::new();
        for (project_name, repo_dir) in others {
            let content = read_tail(&repo_dir.join(PROGRESS_FILE), READ_BUDGET).await;
            for entry in split_entries(&content) {
                let overlap = token_set(&entry).intersection(&query).count();
                if overlap >= 2 {
                    scored.push((overlap, format!("[cross-project: {}]\n{}", project_name, entry)));
                }
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let mut out = String::new();
        for (_, snippet) in scored.into_iter().take(CROSS_ENTRIES) {
            if out.len() + snippet.len() > CROSS_BUDGET {
                break;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&snippet);
        }
        out
    }
}

fn format_entry(record: &CompletionRecord<'_>, reflection: &str) -> String {
    let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M UTC");
    let commit = if record.commit_id.is_empty() {
        "N/A".to_string()
    } else {
        record.commit_id.chars().take(12).collect()
    };
    format!(
        "\n## [{}] {}\n- **Task**: {}\n- **Worker**: {}\n- **Commit**: `{}`\n{}\n",
        timestamp, record.task_title, record.task_id, record.worker_id, commit, reflection
    )
}

/// Last assistant messages from a worker's stream-json log, joined and
/// bounded for the reflection prompt.
async fn extract_log_summary(log_file: &Path) -> String {
    let Ok(content) = tokio::fs::read_to_string(log_file).await else {
        return String::new();
    };
    let events = parse_jsonl(&content);
    let texts: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            crate::stream::LogEvent::Assistant { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect();
    let start = texts.len().saturating_sub(5);
    truncate_tail(&texts[start..].join("\n---\n"), LOG_SUMMARY_BUDGET)
}

/// Split progress content into `## `-headed entries, dropping the file
/// preamble.
fn split_entries(content: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current: Option<String> = None;
    for line in content.lines() {
        if line.starts_with("## ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(line.to_string());
        } else if let Some(entry) = current.as_mut() {
            entry.push('\n');
            entry.push_str(line);
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}

async fn read_tail(path: &Path, budget: usize) -> String {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return String::new();
    };
    truncate_tail(&content, budget)
}

/// Keep the trailing `budget` bytes, snapped to a char boundary.
fn truncate_tail(s: &str, budget: usize) -> String {
    if s.len() <= budget {
        return s.to_string();
    }
    let mut start = s.len() - budget;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// Lowercased, lightly stemmed token set for lexical overlap scoring.
fn token_set(text: &str) -> std::collections::HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(stem)
        .collect()
}

/// Suffix-stripping stemmer: enough to make "tests", "tested", and
/// "testing" collide.
fn stem(token: &str) -> String {
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(stripped) = token.strip_suffix(suffix)
            && stripped.len() >= 3
        {
            return stripped.to_string();
        }
    }
    token.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;

    fn indexer_with(agent: Arc<MockAgent>) -> ExperienceIndexer {
        ExperienceIndexer::new(agent, Git::new())
    }

    async fn scratch_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let git = Git::new();
        git.init_new(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("README.md"), "# x\n").await.unwrap();
        git.commit_all(dir.path(), "init").await.unwrap();
        dir
    }

    #[test]
    fn test_stemming_collides_inflections() {
        assert_eq!(stem("tests"), "test");
        assert_eq!(stem("tested"), "test");
        assert_eq!(stem("testing"), "test");
        assert_eq!(stem("fixes"), "fix");
        // Too short to strip.
        assert_eq!(stem("was"), "was");
    }

    #[test]
    fn test_split_entries_drops_preamble() {
        let content = "# Development Progress\n\nintro\n\n## [2026-01-01] first\nbody one\n\n## [2026-01-02] second\nbody two\n";
        let entries = split_entries(content);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with("## [2026-01-01] first"));
        assert!(entries[1].contains("body two"));
    }

    #[tokio::test]
    async fn test_record_completion_appends_and_commits() {
        let repo = scratch_repo().await;
        let agent = Arc::new(MockAgent::new());
        agent.push_text(
            "- **Problem**: flaky date handling\n- **Solution**: pinned timezone\n- **Prevention**: use UTC\n- **Key files**: src/time.rs",
        );
        let indexer = indexer_with(Arc::clone(&agent));

        // Worker log with one assistant message. Kept outside the repo dir
        // so it doesn't show up as an untracked file in git status.
        let log_dir = tempfile::tempdir().unwrap();
        let log = log_dir.path().join("worker-1.jsonl");
        tokio::fs::write(
            &log,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"fixed the bug"}]}}"#,
        )
        .await
        .unwrap();

        indexer
            .record_completion(
                repo.path(),
                CompletionRecord {
                    task_id: "t-000007",
                    task_title: "fix date handling",
                    worker_id: "worker-1",
                    commit_id: "abcdef1234567890",
                    log_file: &log,
                },
            )
            .await;

        let progress = tokio::fs::read_to_string(repo.path().join(PROGRESS_FILE))
            .await
            .unwrap();
        assert!(progress.contains("fix date handling"));
        assert!(progress.contains("- **Task**: t-000007"));
        assert!(progress.contains("`abcdef123456`"));
        assert!(progress.contains("pinned timezone"));

        // Committed with the documented message.
        let git = Git::new();
        let head = git.head_sha(repo.path()).await.unwrap();
        assert!(!head.is_empty());
        assert!(!git.is_dirty(repo.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_completion_fallback_without_log() {
        let repo = scratch_repo().await;
        let agent = Arc::new(MockAgent::new());
        let indexer = indexer_with(Arc::clone(&agent));

        indexer
            .record_completion(
                repo.path(),
                CompletionRecord {
                    task_id: "t-000008",
                    task_title: "quiet task",
                    worker_id: "worker-2",
                    commit_id: "",
                    log_file: Path::new("/nonexistent/log.jsonl"),
                },
            )
            .await;

        let progress = tokio::fs::read_to_string(repo.path().join(PROGRESS_FILE))
            .await
            .unwrap();
        assert!(progress.contains("quiet task"));
        assert!(progress.contains("without notable issues"));
        // No log means no reflection call.
        assert_eq!(agent.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_recent_entries_bounded_by_count() {
        let repo = scratch_repo().await;
        let mut content = PROGRESS_HEADER.to_string();
        for i in 0..8 {
            content.push_str(&format!("\n## [2026-01-0{} 10:00 UTC] task {}\n- body\n", i % 9 + 1, i));
        }
        tokio::fs::write(repo.path().join(PROGRESS_FILE), content)
            .await
            .unwrap();

        let indexer = indexer_with(Arc::new(MockAgent::new()));
        let recent = indexer.recent_entries(repo.path()).await;
        assert!(!recent.contains("task 2"));
        for i in 3..8 {
            assert!(recent.contains(&format!("task {}", i)), "missing task {}", i);
        }
    }

    #[tokio::test]
    async fn test_recent_entries_bounded_by_bytes() {
        let repo = scratch_repo().await;
        let mut content = PROGRESS_HEADER.to_string();
        for i in 0..5 {
            content.push_str(&format!("\n## entry {}\n{}\n", i, "x".repeat(2000)));
        }
        tokio::fs::write(repo.path().join(PROGRESS_FILE), content)
            .await
            .unwrap();

        let indexer = indexer_with(Arc::new(MockAgent::new()));
        let recent = indexer.recent_entries(repo.path()).await;
        assert!(recent.len() <= PROMPT_BUDGET);
    }

    #[tokio::test]
    async fn test_recent_entries_missing_file_is_empty() {
        let repo = scratch_repo().await;
        let indexer = indexer_with(Arc::new(MockAgent::new()));
        assert_eq!(indexer.recent_entries(repo.path()).await, "");
    }

    #[tokio::test]
    async fn test_cross_project_matches_by_overlap() {
        let relevant = scratch_repo().await;
        let irrelevant = scratch_repo().await;
        tokio::fs::write(
            relevant.path().join(PROGRESS_FILE),
            "## [x] websocket reconnect fix\n- **Problem**: websocket reconnect raced the auth handshake\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            irrelevant.path().join(PROGRESS_FILE),
            "## [x] css polish\n- **Problem**: button colors inconsistent\n",
        )
        .await
        .unwrap();

        let indexer = indexer_with(Arc::new(MockAgent::new()));
        let others = vec![
            ("chat-app".to_string(), relevant.path().to_path_buf()),
            ("site".to_string(), irrelevant.path().to_path_buf()),
        ];
        let out = indexer
            .cross_project(&others, "fix websocket reconnect", "handshake fails on reconnecting")
            .await;
        assert!(out.contains("[cross-project: chat-app]"));
        assert!(out.contains("websocket"));
        assert!(!out.contains("css"));
        assert!(out.len() <= CROSS_BUDGET);
    }

    #[tokio::test]
    async fn test_cross_project_empty_query() {
        let indexer = indexer_with(Arc::new(MockAgent::new()));
        assert_eq!(indexer.cross_project(&[], "", "").await, "");
    }
}
