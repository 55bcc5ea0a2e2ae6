//! Read-only repository views for the gateway: commit log with graph lanes,
//! per-commit diff stats, and ahead-of-remote counts.
//!
//! Built on libgit2 so reads never contend with the subprocess side for the
//! index. Everything here is synchronous; callers run it on the blocking
//! pool.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use git2::{BranchType, Delta, DiffOptions, Oid, Repository, Sort};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CommitInfo {
    pub sha: String,
    pub short: String,
    pub parents: Vec<String>,
    pub message: String,
    pub author: String,
    pub time_ago: String,
    pub refs: Vec<String>,
    pub lane: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitFileChange {
    pub path: String,
    pub status: String,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitDetail {
    pub body: String,
    pub files: Vec<CommitFileChange>,
}

/// `true` for a plausible (possibly abbreviated) hex object id. Guards the
/// URL path parameter before it reaches libgit2.
pub fn is_valid_sha(s: &str) -> bool {
    (4..=40).contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn humanize_age(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (value, unit) = if seconds < 60 {
        return "just now".to_string();
    } else if seconds < 3600 {
        (seconds / 60, "minute")
    } else if seconds < 86400 {
        (seconds / 3600, "hour")
    } else if seconds < 86400 * 30 {
        (seconds / 86400, "day")
    } else if seconds < 86400 * 365 {
        (seconds / (86400 * 30), "month")
    } else {
        (seconds / (86400 * 365), "year")
    };
    if value == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", value, unit)
    }
}

/// Lane assignment for the commit graph, over commits in display order
/// (newest first). A commit takes the first lane that expects it; its first
/// parent inherits that lane; each additional parent (merge source) gets the
/// first free slot; a lane is freed when no active descendant remains.
/// Deterministic for a fixed commit order.
pub fn assign_lanes(commits: &[(String, Vec<String>)]) -> Vec<usize> {
    let mut lanes: Vec<Option<String>> = Vec::new();
    let mut result = Vec::with_capacity(commits.len());

    for (sha, parents) in commits {
        let holders: Vec<usize> = lanes
            .iter()
            .enumerate()
            .filter(|(_, expected)| expected.as_deref() == Some(sha.as_str()))
            .map(|(i, _)| i)
            .collect();

        let lane = match holders.first() {
            Some(&lane) => {
                // Multiple branches converge on this commit; keep the
                // leftmost lane, free the rest.
                for &extra in &holders[1..] {
                    lanes[extra] = None;
                }
                lane
            }
            None => match lanes.iter().position(Option::is_none) {
                Some(free) => free,
                None => {
                    lanes.push(None);
                    lanes.len() - 1
                }
            },
        };

        match parents.first() {
            Some(first_parent) => lanes[lane] = Some(first_parent.clone()),
            None => lanes[lane] = None,
        }
        for parent in parents.iter().skip(1) {
            if !lanes.iter().any(|e| e.as_deref() == Some(parent.as_str())) {
                match lanes.iter().position(Option::is_none) {
                    Some(free) => lanes[free] = Some(parent.clone()),
                    None => lanes.push(Some(parent.clone())),
                }
            }
        }
        result.push(lane);
    }
    result
}

/// Topologically ordered commit log across all refs, decorated with branch
/// names and graph lanes.
pub fn log(repo_dir: &Path, limit: usize) -> Result<Vec<CommitInfo>> {
    let repo = Repository::open(repo_dir).context("Failed to open git repository")?;

    let mut refs_by_oid: HashMap<Oid, Vec<String>> = HashMap::new();
    if let Ok(references) = repo.references() {
        for reference in references.flatten() {
            if let (Some(name), Some(oid)) = (reference.shorthand(), reference.target()) {
                refs_by_oid.entry(oid).or_default().push(name.to_string());
            }
        }
    }

    let mut revwalk = repo.revwalk()?;
    revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
    let mut pushed_any = false;
    for glob in ["refs/heads/*", "refs/remotes/*"] {
        if revwalk.push_glob(glob).is_ok() {
            pushed_any = true;
        }
    }
    if let Ok(head) = repo.head()
        && let Some(oid) = head.target()
    {
        let _ = revwalk.push(oid);
        pushed_any = true;
    }
    if !pushed_any {
        return Ok(Vec::new());
    }

    let now = chrono::Utc::now().timestamp();
    let mut commits = Vec::new();
    for oid in revwalk.flatten().take(limit) {
        let Ok(commit) = repo.find_commit(oid) else {
            continue;
        };
        let sha = oid.to_string();
        commits.push(CommitInfo {
            short: sha[..7].to_string(),
            parents: commit.parent_ids().map(|p| p.to_string()).collect(),
            message: commit.summary().unwrap_or("").to_string(),
            author: commit.author().name().unwrap_or("unknown").to_string(),
            time_ago: humanize_age(now - commit.time().seconds()),
            refs: refs_by_oid.get(&oid).cloned().unwrap_or_default(),
            lane: 0,
            sha,
        });
    }

    let shape: Vec<(String, Vec<String>)> = commits
        .iter()
        .map(|c| (c.sha.clone(), c.parents.clone()))
        .collect();
    for (commit, lane) in commits.iter_mut().zip(assign_lanes(&shape)) {
        commit.lane = lane;
    }
    Ok(commits)
}

/// Full message body plus per-file change stats for one commit.
pub fn commit_detail(repo_dir: &Path, sha: &str) -> Result<CommitDetail> {
    anyhow::ensure!(is_valid_sha(sha), "invalid commit id: {}", sha);
    let repo = Repository::open(repo_dir).context("Failed to open git repository")?;
    let commit = repo
        .revparse_single(sha)
        .with_context(|| format!("Unknown commit {}", sha))?
        .peel_to_commit()
        .context("Object is not a commit")?;

    let body = commit.message().unwrap_or("").trim().to_string();
    let tree = commit.tree()?;
    let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());

    let mut opts = DiffOptions::new();
    let mut diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;
    diff.find_similar(None)?;

    let mut files = Vec::new();
    for delta_idx in 0..diff.deltas().len() {
        let Some(delta) = diff.get_delta(delta_idx) else {
            continue;
        };
        let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
            continue;
        };
        let status = match delta.status() {
            Delta::Added => "A",
            Delta::Modified => "M",
            Delta::Deleted => "D",
            Delta::Renamed => "R",
            _ => continue,
        };

        let mut additions = 0u32;
        let mut deletions = 0u32;
        if let Ok(Some(mut patch)) = git2::Patch::from_diff(&diff, delta_idx) {
            patch
                .print(&mut |_delta, _hunk, line| {
                    match line.origin() {
                        '+' => additions += 1,
                        '-' => deletions += 1,
                        _ => {}
                    }
                    true
                })
                .ok();
        }

        files.push(CommitFileChange {
            path: path.to_string_lossy().to_string(),
            status: status.to_string(),
            additions,
            deletions,
        });
    }

    Ok(CommitDetail { body, files })
}

/// `(commits ahead of origin/<branch>, repo has a remote)`.
pub fn unpushed_count(repo_dir: &Path, branch: &str) -> Result<(usize, bool)> {
    let repo = Repository::open(repo_dir).context("Failed to open git repository")?;
    let has_remote = repo.remotes().map(|r| !r.is_empty()).unwrap_or(false);
    if !has_remote {
        return Ok((0, false));
    }

    let local = repo
        .find_branch(branch, BranchType::Local)
        .ok()
        .and_then(|b| b.get().target());
    let upstream = repo
        .find_branch(&format!("origin/{}", branch), BranchType::Remote)
        .ok()
        .and_then(|b| b.get().target());

    match (local, upstream) {
        (Some(local), Some(upstream)) => {
            let (ahead, _behind) = repo.graph_ahead_behind(local, upstream)?;
            Ok((ahead, true))
        }
        _ => Ok((0, true)),
    }
}
