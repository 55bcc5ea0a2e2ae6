//! Rebase-and-test pipeline for a finished task branch.
//!
//! Rebases the worktree onto the freshest base ref, detects the project's
//! test framework, runs the tests, and asks the agent to repair conflicts or
//! failing tests, bounded to a few attempts. Never touches remote merge or
//! push — honoring the project's auto-merge/auto-push flags is the
//! scheduler's job.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{Agent, AgentRequest};
use crate::events::EventBus;
use crate::git::{Git, RebaseOutcome};
use crate::models::{TaskPatch, TaskStatus};
use crate::store::Store;

const MAX_ATTEMPTS: u32 = 3;
const AGENT_FIX_TIMEOUT: Duration = Duration::from_secs(600);
const TEST_TIMEOUT: Duration = Duration::from_secs(600);
/// Pause before retrying a rebase that failed for non-conflict reasons.
const REBASE_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Cap on the test-output tail surfaced through dispatcher events.
const TAIL_BYTES: usize = 6000;
const TAIL_LINES: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Rebase and tests succeeded; the worktree's final HEAD sha.
    Ok(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TestFramework {
    Node,
    Python,
}

/// Inspect the worktree for a test setup. A `package.json` counts only when
/// its `scripts.test` exists and is not npm's placeholder.
pub fn detect_test_framework(worktree: &Path) -> Option<TestFramework> {
    let package_json = worktree.join("package.json");
    if let Ok(content) = std::fs::read_to_string(&package_json)
        && let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&content)
        && let Some(script) = parsed
            .get("scripts")
            .and_then(|s| s.get("test"))
            .and_then(|t| t.as_str())
        && !script.contains("no test specified")
    {
        return Some(TestFramework::Node);
    }

    for marker in ["pytest.ini", "pyproject.toml", "setup.py"] {
        if worktree.join(marker).exists() {
            return Some(TestFramework::Python);
        }
    }
    None
}

struct TestRun {
    success: bool,
    output: String,
}

pub struct MergeContext {
    pub worktree: PathBuf,
    pub repo: PathBuf,
    pub base_branch: String,
    pub worker_id: String,
    pub project_id: String,
    pub task_id: String,
}

pub struct MergeTestEngine {
    git: Git,
    agent: Arc<dyn Agent>,
    store: Store,
    events: Arc<EventBus>,
}

impl MergeTestEngine {
    pub fn new(git: Git, agent: Arc<dyn Agent>, store: Store, events: Arc<EventBus>) -> Self {
        Self {
            git,
            agent,
            store,
            events,
        }
    }

    pub async fn run(&self, ctx: &MergeContext) -> MergeOutcome {
        let mut last_reason = String::from("retries exhausted");

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                self.events.emit(
                    &ctx.worker_id,
                    format!("merge/test attempt {} of {}", attempt, MAX_ATTEMPTS),
                );
            }

            self.git.fetch(&ctx.repo, "origin").await;

            match self.rebase_step(ctx).await {
                Ok(true) => {}
                Ok(false) => {
                    last_reason = "rebase conflicts unresolved".to_string();
                    continue;
                }
                Err(reason) => {
                    last_reason = reason;
                    tokio::time::sleep(REBASE_RETRY_DELAY).await;
                    continue;
                }
            }

            let Some(framework) = detect_test_framework(&ctx.worktree) else {
                self.events
                    .emit(&ctx.worker_id, "no tests configured, skipping test run");
                return match self.git.head_sha(&ctx.worktree).await {
                    Ok(sha) => MergeOutcome::Ok(sha),
                    Err(e) => MergeOutcome::Failed(e.excerpt()),
                };
            };

            self.set_status(ctx, TaskStatus::Testing).await;
            let test_run = run_tests(&ctx.worktree, framework).await;
            if test_run.success {
                return match self.git.head_sha(&ctx.worktree).await {
                    Ok(sha) => MergeOutcome::Ok(sha),
                    Err(e) => MergeOutcome::Failed(e.excerpt()),
                };
            }

            self.emit_tail(&ctx.worker_id, &test_run.output);
            last_reason = "tests failed".to_string();
            self.fix_tests_step(ctx, &test_run.output).await;
            self.set_status(ctx, TaskStatus::Merging).await;
        }

        MergeOutcome::Failed(last_reason)
    }

    /// One rebase attempt. Ok(true): worktree is rebased clean. Ok(false):
    /// conflicts remain after the agent tried. Err: aborted for another
    /// reason and the caller should back off.
    async fn rebase_step(&self, ctx: &MergeContext) -> Result<bool, String> {
        let origin_ref = format!("origin/{}", ctx.base_branch);
        let target = if self.git.ref_sha(&ctx.repo, &origin_ref).await.is_some() {
            origin_ref
        } else if self
            .git
            .ref_sha(&ctx.repo, &ctx.base_branch)
            .await
            .is_some()
        {
            ctx.base_branch.clone()
        } else {
            // Nothing to rebase onto (fresh repo): skip.
            return Ok(true);
        };

        match self.git.rebase(&ctx.worktree, &target).await {
            Ok(RebaseOutcome::Clean) => Ok(true),
            Ok(RebaseOutcome::Conflict(files)) => {
                self.events.emit(
                    &ctx.worker_id,
                    format!("rebase conflict in {}", files.join(", ")),
                );
                let prompt = conflict_prompt(&files, &target);
                let _ = self
                    .agent
                    .run(AgentRequest::new(&ctx.worktree, prompt, AGENT_FIX_TIMEOUT))
                    .await;

                // The agent resolves on disk but does not stage, so the
                // index still lists the files as unmerged; what decides the
                // outcome is whether conflict markers remain.
                let unresolved = files_with_conflict_markers(&ctx.worktree, &files).await;
                if unresolved.is_empty() {
                    match self.git.rebase_continue(&ctx.worktree).await {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            self.git.rebase_abort(&ctx.worktree).await;
                            Err(e.excerpt())
                        }
                    }
                } else {
                    self.git.rebase_abort(&ctx.worktree).await;
                    Ok(false)
                }
            }
            Ok(RebaseOutcome::AbortedOther) => {
                self.git.rebase_abort(&ctx.worktree).await;
                Err("rebase aborted for non-conflict reason".to_string())
            }
            Err(e) => {
                self.git.rebase_abort(&ctx.worktree).await;
                Err(e.excerpt())
            }
        }
    }

    /// Ask the agent to fix the failing tests and commit its work so the
    /// next attempt rebases on top of it.
    async fn fix_tests_step(&self, ctx: &MergeContext, test_output: &str) {
        let prompt = fix_tests_prompt(test_output);
        let _ = self
            .agent
            .run(AgentRequest::new(&ctx.worktree, prompt, AGENT_FIX_TIMEOUT))
            .await;
        let _ = self
            .git
            .commit_all(&ctx.worktree, "fix failing tests")
            .await;
    }

    async fn set_status(&self, ctx: &MergeContext, status: TaskStatus) {
        let _ = self
            .store
            .update_task(&ctx.project_id, &ctx.task_id, TaskPatch::status(status))
            .await;
    }

    fn emit_tail(&self, worker_id: &str, output: &str) {
        if output.trim().is_empty() {
            return;
        }
        let lines: Vec<&str> = output.lines().collect();
        let start = lines.len().saturating_sub(TAIL_LINES);
        let mut tail = lines[start..].join("\n");
        if tail.len() > TAIL_BYTES {
            let cut = tail.len() - TAIL_BYTES;
            let mut boundary = cut;
            while boundary < tail.len() && !tail.is_char_boundary(boundary) {
                boundary += 1;
            }
            tail = tail[boundary..].to_string();
        }
        self.events
            .emit(worker_id, format!("merge/test log tail:\n{}", tail));
    }
}

/// Conflicted files that still contain merge markers after the agent's
/// attempt. A file deleted as part of the resolution counts as resolved.
async fn files_with_conflict_markers(worktree: &Path, files: &[String]) -> Vec<String> {
    let mut unresolved = Vec::new();
    for file in files {
        if let Ok(content) = tokio::fs::read_to_string(worktree.join(file)).await
            && content.contains("<<<<<<<")
        {
            unresolved.push(file.clone());
        }
    }
    unresolved
}

fn conflict_prompt(files: &[String], target: &str) -> String {
    format!(
        "A rebase onto {} stopped on merge conflicts in this working directory.\n\
         Conflicted files:\n{}\n\n\
         Resolve every conflict marker in those files, keeping both the intent of the \
         rebased change and the upstream edits. Work only inside the current directory. \
         Do not run `git rebase --continue` or touch the `.git` file; just leave the \
         files resolved on disk.",
        target,
        files
            .iter()
            .map(|f| format!("- {}", f))
            .collect::<Vec<_>>()
            .join("\n")
    )
}

fn fix_tests_prompt(test_output: &str) -> String {
    let mut output = test_output.to_string();
    if output.len() > TAIL_BYTES {
        let cut = output.len() - TAIL_BYTES;
        let mut boundary = cut;
        while boundary < output.len() && !output.is_char_boundary(boundary) {
            boundary += 1;
        }
        output = output[boundary..].to_string();
    }
    format!(
        "The test suite in this working directory is failing. Trailing test output:\n\n\
         ```\n{}\n```\n\n\
         Fix the code (or the tests, when they are plainly wrong) so the suite passes. \
         Work only inside the current directory and do not touch the `.git` file.",
        output
    )
}

async fn run_tests(worktree: &Path, framework: TestFramework) -> TestRun {
    let (program, args): (&str, &[&str]) = match framework {
        TestFramework::Node => ("npm", &["test", "--silent"]),
        TestFramework::Python => ("python3", &["-m", "pytest", "-x", "-q"]),
    };

    let fut = tokio::process::Command::new(program)
        .args(args)
        .current_dir(worktree)
        .stdin(Stdio::null())
        .output();
    match tokio::time::timeout(TEST_TIMEOUT, fut).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                combined.push('\n');
                combined.push_str(&stderr);
            }
            TestRun {
                success: output.status.success(),
                output: combined,
            }
        }
        Ok(Err(e)) => TestRun {
            success: false,
            output: format!("failed to run {}: {}", program, e),
        },
        Err(_) => TestRun {
            success: false,
            output: format!("tests timed out after {}s", TEST_TIMEOUT.as_secs()),
        },
    }
}
