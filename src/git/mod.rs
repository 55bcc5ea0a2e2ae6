//! Thin semantic wrapper over the `git` CLI for all mutating operations.
//!
//! Every call is pure: it takes the directory to operate in, captures
//! stdout/stderr, and reports failure as [`GitError`] with the stderr text.
//! Read-only history views (log, commit diffs, unpushed counts) live in
//! [`history`] on top of libgit2.

pub mod history;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::errors::GitError;

/// Default timeout for a single git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Network operations (clone, fetch, push) get longer.
const GIT_NETWORK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Outcome of a rebase attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RebaseOutcome {
    Clean,
    /// Stopped on content conflicts in these files.
    Conflict(Vec<String>),
    /// Failed for a reason other than content conflicts (lock contention,
    /// in-progress state). Caller aborts and retries.
    AbortedOther,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
}

/// Stateless git runner.
#[derive(Debug, Clone, Default)]
pub struct Git;

impl Git {
    pub fn new() -> Self {
        Self
    }

    async fn run_with_timeout(
        &self,
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput, GitError> {
        let op = args.first().copied().unwrap_or("git").to_string();
        let fut = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output();
        let output = match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(GitError::new(op, format!("failed to spawn git: {}", e))),
            Err(_) => {
                return Err(GitError::new(
                    op,
                    format!("timed out after {}s", timeout.as_secs()),
                ));
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            Ok(GitOutput { stdout, stderr })
        } else {
            Err(GitError::new(op, if stderr.trim().is_empty() { stdout } else { stderr }))
        }
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        self.run_with_timeout(dir, args, GIT_TIMEOUT).await
    }

    /// Run and ignore failure. For cleanup paths where stale state is fine.
    async fn run_quiet(&self, dir: &Path, args: &[&str]) {
        let _ = self.run(dir, args).await;
    }

    // ── Repository setup ──────────────────────────────────────────────

    pub async fn clone_repo(&self, url: &str, branch: &str, dir: &Path) -> Result<(), GitError> {
        let parent = dir.parent().unwrap_or(Path::new("."));
        let target = dir.to_string_lossy().to_string();
        self.run_with_timeout(
            parent,
            &["clone", "--branch", branch, url, &target],
            GIT_NETWORK_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Initialize an empty repository with a deterministic identity for the
    /// engine's own commits.
    pub async fn init_new(&self, dir: &Path) -> Result<(), GitError> {
        self.run(dir, &["init", "-b", "main"]).await?;
        self.set_identity(dir).await
    }

    /// Give a managed repository a commit identity of its own, so engine
    /// commits (experience log, squash merges) work on hosts without a
    /// global git config.
    pub async fn set_identity(&self, dir: &Path) -> Result<(), GitError> {
        self.run(dir, &["config", "user.name", "shipyard"]).await?;
        self.run(dir, &["config", "user.email", "shipyard@localhost"])
            .await?;
        Ok(())
    }

    /// Best-effort fetch; clone-less repos and offline runs are tolerated.
    pub async fn fetch(&self, dir: &Path, remote: &str) {
        let _ = self
            .run_with_timeout(dir, &["fetch", remote], GIT_NETWORK_TIMEOUT)
            .await;
    }

    pub async fn head_sha(&self, dir: &Path) -> Result<String, GitError> {
        let out = self.run(dir, &["rev-parse", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Resolve a ref to a sha, or None if it does not exist.
    pub async fn ref_sha(&self, dir: &Path, reference: &str) -> Option<String> {
        self.run(dir, &["rev-parse", "--verify", reference])
            .await
            .ok()
            .map(|out| out.stdout.trim().to_string())
    }

    pub async fn current_branch(&self, dir: &Path) -> Result<String, GitError> {
        let out = self.run(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// Pick the rebase/worktree base: `origin/<base>` if present, else the
    /// local `<base>`, else `HEAD`.
    pub async fn resolve_base_ref(&self, repo: &Path, base: &str) -> String {
        for candidate in [format!("origin/{}", base), base.to_string()] {
            if self.ref_sha(repo, &candidate).await.is_some() {
                return candidate;
            }
        }
        "HEAD".to_string()
    }

    // ── Worktrees ─────────────────────────────────────────────────────

    /// Create a fresh worktree on a new branch at `base_ref`. Fails if the
    /// branch is checked out elsewhere; callers clear stale holders first via
    /// [`Git::remove_worktree_holding_branch`].
    pub async fn worktree_add(
        &self,
        repo: &Path,
        branch: &str,
        dir: &Path,
        base_ref: &str,
    ) -> Result<(), GitError> {
        let target = dir.to_string_lossy().to_string();
        self.run(repo, &["worktree", "add", "-b", branch, &target, base_ref])
            .await?;
        Ok(())
    }

    /// Force-remove a worktree; falls back to deleting the directory when
    /// git no longer knows about it.
    pub async fn worktree_remove(&self, repo: &Path, dir: &Path) {
        let target = dir.to_string_lossy().to_string();
        self.run_quiet(repo, &["worktree", "remove", "--force", &target])
            .await;
        if dir.is_dir() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }

    pub async fn worktree_prune(&self, repo: &Path) {
        self.run_quiet(repo, &["worktree", "prune"]).await;
    }

    /// Parse `git worktree list --porcelain` into entries.
    pub async fn worktree_list(&self, repo: &Path) -> Result<Vec<WorktreeEntry>, GitError> {
        let out = self.run(repo, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_porcelain(&out.stdout))
    }

    /// Remove any worktree (other than the repo root) that has `branch`
    /// checked out, so the branch can be recreated.
    pub async fn remove_worktree_holding_branch(&self, repo: &Path, branch: &str) {
        let Ok(entries) = self.worktree_list(repo).await else {
            return;
        };
        for entry in entries {
            if entry.branch.as_deref() == Some(branch) && entry.path != repo {
                self.worktree_remove(repo, &entry.path).await;
            }
        }
    }

    pub async fn delete_branch(&self, repo: &Path, branch: &str) {
        self.run_quiet(repo, &["branch", "-D", branch]).await;
    }

    /// Branch names matching a glob, e.g. `agent/*`.
    pub async fn list_branches(&self, repo: &Path, glob: &str) -> Vec<String> {
        let Ok(out) = self
            .run(repo, &["branch", "--list", "--format=%(refname:short)", glob])
            .await
        else {
            return Vec::new();
        };
        out.stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    // ── Commits, status ───────────────────────────────────────────────

    pub async fn is_dirty(&self, dir: &Path) -> Result<bool, GitError> {
        let out = self.run(dir, &["status", "--porcelain"]).await?;
        Ok(!out.stdout.trim().is_empty())
    }

    /// Stage everything and commit iff the tree is dirty. Returns whether a
    /// commit was made.
    pub async fn commit_all(&self, dir: &Path, message: &str) -> Result<bool, GitError> {
        if !self.is_dirty(dir).await? {
            return Ok(false);
        }
        self.run(dir, &["add", "-A"]).await?;
        self.run(dir, &["commit", "-m", message]).await?;
        Ok(true)
    }

    /// Stash local changes (including untracked). Returns whether anything
    /// was stashed.
    pub async fn stash_all(&self, dir: &Path, message: &str) -> Result<bool, GitError> {
        if !self.is_dirty(dir).await? {
            return Ok(false);
        }
        self.run(dir, &["stash", "push", "--include-untracked", "-m", message])
            .await?;
        Ok(true)
    }

    pub async fn add(&self, dir: &Path, pathspec: &str) -> Result<(), GitError> {
        self.run(dir, &["add", pathspec]).await?;
        Ok(())
    }

    pub async fn is_tracked(&self, dir: &Path, file: &str) -> bool {
        self.run(dir, &["ls-files", "--error-unmatch", file])
            .await
            .is_ok()
    }

    /// Number of commits in `range` (e.g. `main..HEAD`).
    pub async fn rev_list_count(&self, dir: &Path, range: &str) -> Result<usize, GitError> {
        let out = self.run(dir, &["rev-list", "--count", range]).await?;
        Ok(out.stdout.trim().parse().unwrap_or(0))
    }

    // ── Rebase ────────────────────────────────────────────────────────

    pub async fn rebase(&self, dir: &Path, target: &str) -> Result<RebaseOutcome, GitError> {
        match self.run(dir, &["rebase", target]).await {
            Ok(_) => Ok(RebaseOutcome::Clean),
            Err(_) => {
                let conflicts = self.conflicted_files(dir).await;
                if conflicts.is_empty() {
                    Ok(RebaseOutcome::AbortedOther)
                } else {
                    Ok(RebaseOutcome::Conflict(conflicts))
                }
            }
        }
    }

    pub async fn conflicted_files(&self, dir: &Path) -> Vec<String> {
        let Ok(out) = self
            .run(dir, &["diff", "--name-only", "--diff-filter=U"])
            .await
        else {
            return Vec::new();
        };
        out.stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    pub async fn rebase_continue(&self, dir: &Path) -> Result<(), GitError> {
        // Stage resolved files first; the agent edits but does not always add.
        self.run_quiet(dir, &["add", "-A"]).await;
        let op = "rebase --continue";
        let output = Command::new("git")
            .args(["rebase", "--continue"])
            .current_dir(dir)
            .env("GIT_EDITOR", "true")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| GitError::new(op, format!("failed to spawn git: {}", e)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(GitError::new(
                op,
                String::from_utf8_lossy(&output.stderr).to_string(),
            ))
        }
    }

    pub async fn rebase_abort(&self, dir: &Path) {
        self.run_quiet(dir, &["rebase", "--abort"]).await;
    }

    // ── Merge & push ──────────────────────────────────────────────────

    pub async fn checkout(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.run(repo, &["checkout", branch]).await?;
        Ok(())
    }

    /// Checkout `branch`, recreating it from `origin/<branch>` if the local
    /// ref is unusable.
    pub async fn checkout_base(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        if self.checkout(repo, branch).await.is_ok() {
            return Ok(());
        }
        let origin_ref = format!("origin/{}", branch);
        self.run(repo, &["checkout", "-B", branch, &origin_ref]).await?;
        Ok(())
    }

    /// Merge `branch` into the currently checked-out branch. Returns false
    /// (after aborting) when the merge stops on conflicts.
    pub async fn merge(&self, repo: &Path, branch: &str, squash: bool) -> Result<bool, GitError> {
        let result = if squash {
            self.run(repo, &["merge", "--squash", branch]).await
        } else {
            self.run(repo, &["merge", branch, "--no-edit"]).await
        };
        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                self.run_quiet(repo, &["merge", "--abort"]).await;
                eprintln!("[git] merge of {} failed: {}", branch, e.stderr.trim());
                Ok(false)
            }
        }
    }

    pub async fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.run(dir, &["commit", "-m", message]).await?;
        Ok(())
    }

    pub async fn push(&self, repo: &Path, remote: &str, reference: &str) -> Result<(), GitError> {
        self.run_with_timeout(repo, &["push", remote, reference], GIT_NETWORK_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn delete_remote_branch(&self, repo: &Path, remote: &str, branch: &str) {
        let _ = self
            .run_with_timeout(
                repo,
                &["push", remote, "--delete", branch],
                GIT_NETWORK_TIMEOUT,
            )
            .await;
    }

    pub async fn has_remote(&self, repo: &Path) -> bool {
        match self.run(repo, &["remote"]).await {
            Ok(out) => !out.stdout.trim().is_empty(),
            Err(_) => false,
        }
    }

    // ── Worktree-link integrity ───────────────────────────────────────

    /// Snapshot of the worktree's `.git` pointer file. In a linked worktree
    /// this is a one-line text file (`gitdir: …`) that an untrusted agent
    /// must not be able to destroy.
    pub async fn snapshot_worktree_link(&self, worktree: &Path) -> Result<String, GitError> {
        let link = worktree.join(".git");
        tokio::fs::read_to_string(&link)
            .await
            .map_err(|e| GitError::new("worktree-link", format!("{}: {}", link.display(), e)))
    }

    /// After a container exits: the pointer must still be a file with the
    /// same content. Replaced, removed, or turned into a directory all count
    /// as corruption.
    pub async fn verify_worktree_link(&self, worktree: &Path, snapshot: &str) -> bool {
        let link = worktree.join(".git");
        match tokio::fs::metadata(&link).await {
            Ok(meta) if meta.is_file() => {
                matches!(tokio::fs::read_to_string(&link).await, Ok(content) if content == snapshot)
            }
            _ => false,
        }
    }

    // ── Exclusions ────────────────────────────────────────────────────

    /// Add `name` to the repository's `.git/info/exclude` so an injected
    /// file is never committed. Idempotent.
    pub async fn exclude_from_tracking(&self, dir: &Path, name: &str) -> Result<(), GitError> {
        let out = self.run(dir, &["rev-parse", "--git-dir"]).await?;
        let mut git_dir = PathBuf::from(out.stdout.trim());
        if git_dir.is_relative() {
            git_dir = dir.join(git_dir);
        }
        let info_dir = git_dir.join("info");
        let exclude = info_dir.join("exclude");
        tokio::fs::create_dir_all(&info_dir)
            .await
            .map_err(|e| GitError::new("exclude", e.to_string()))?;
        let existing = tokio::fs::read_to_string(&exclude).await.unwrap_or_default();
        if !existing.lines().any(|l| l.trim() == name) {
            let mut content = existing;
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(name);
            content.push('\n');
            tokio::fs::write(&exclude, content)
                .await
                .map_err(|e| GitError::new("exclude", e.to_string()))?;
        }
        Ok(())
    }
}

fn parse_worktree_porcelain(output: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path.trim()),
                branch: None,
            });
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/")
            && let Some(entry) = current.as_mut()
        {
            entry.branch = Some(branch.trim().to_string());
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}
