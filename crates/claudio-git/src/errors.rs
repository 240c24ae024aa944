//! Error types shared by the git plumbing layer.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while driving git subprocesses.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute at all.
    #[error("git command failed: {message}")]
    Command {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A named branch does not exist in the repository.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// Neither `main` nor `master` exists.
    #[error("no main branch: neither 'main' nor 'master' exists")]
    NoMainBranch,

    /// Counting commits between two refs failed. Callers treat this as a
    /// warning rather than a task failure.
    #[error("could not count commits {base}..{head}: {stderr}")]
    CommitCountUnavailable {
        base: String,
        head: String,
        stderr: String,
    },

    /// A cherry-pick stopped on a merge conflict. Carries enough context
    /// for a structured conflict report; the raw git output is preserved
    /// for diagnostics.
    #[error("cherry-pick of {commit} from {branch} conflicted on {} file(s)", files.len())]
    CherryPickConflict {
        branch: String,
        commit: String,
        files: Vec<String>,
        raw_output: String,
    },

    /// The worktree path already exists but is associated with a different
    /// branch than expected.
    #[error("worktree path exists but has unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    /// Failed to parse porcelain output from `git worktree list`.
    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

impl GitError {
    /// Whether this error is a cherry-pick conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::CherryPickConflict { .. })
    }
}
