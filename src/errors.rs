//! Typed error hierarchy for the Shipyard engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — persistence and state-machine failures
//! - `GitError` — subprocess git failures with captured stderr
//! - `RuntimeError` — container runtime failures

use thiserror::Error;

use crate::models::TaskStatus;

/// Errors from the file-backed store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Timed out acquiring lock on {path} after {waited_ms}ms")]
    LockTimeout {
        path: std::path::PathBuf,
        waited_ms: u64,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid task transition {from} -> {to}")]
    Conflict { from: TaskStatus, to: TaskStatus },

    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }
}

/// A git subprocess invocation that exited non-zero.
#[derive(Debug, Error)]
#[error("git {op} failed: {stderr}")]
pub struct GitError {
    pub op: String,
    pub stderr: String,
}

impl GitError {
    pub fn new(op: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            stderr: stderr.into(),
        }
    }

    /// Short excerpt suitable for a task error field.
    pub fn excerpt(&self) -> String {
        let mut s = format!("git {} failed: {}", self.op, self.stderr.trim());
        if s.len() > 300 {
            s.truncate(300);
        }
        s
    }
}

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Container runtime is not available: {0}")]
    NotAvailable(String),

    #[error("Failed to start container {name}: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("No container for worker {0}")]
    NoContainer(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
