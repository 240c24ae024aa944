//! Git plumbing for the claudio orchestration core.
//!
//! Every task runs in its own git worktree and lands its work on a dedicated
//! branch; consolidation cherry-picks those branches together. This crate
//! wraps the handful of git operations the core relies on: worktree
//! management, branch bookkeeping, commit counting, cherry-picking with
//! conflict detection, and pushing.
//!
//! All mutating operations on the shared repository are serialised through a
//! single lock. Git uses a lock file on the shared object store, so two
//! concurrent worktree-level mutations can race each other even when they
//! touch different worktrees.

pub mod errors;
pub mod repo;
pub mod worktree;

pub use errors::GitError;
pub use repo::GitRepo;
pub use worktree::{WorktreeInfo, WorktreeManager};
