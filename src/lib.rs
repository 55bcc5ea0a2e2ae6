//! Shipyard: an orchestration engine that runs autonomous coding-agent
//! containers in parallel against managed git repositories.
//!
//! A task submitted through the gateway is claimed by a worker slot, executed
//! by the agent inside an ephemeral container mounted on a git worktree, then
//! rebased, tested, and merged back — with every completion distilled into
//! the repository's experience log for future runs.

pub mod agent;
pub mod config;
pub mod errors;
pub mod events;
pub mod experience;
pub mod git;
pub mod merge;
pub mod models;
pub mod plan;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod stream;
pub mod supervisor;
