//! Git worktree management for workspace isolation.
//!
//! Each task runs in its own git worktree, providing filesystem isolation
//! without the overhead of full repository clones. Worktrees share the
//! object store of the main repository but have independent working
//! directories and index files. Consolidation uses an auxiliary worktree
//! checked out to the consolidation branch.

use std::path::{Path, PathBuf};

use crate::errors::GitError;
use crate::repo::GitRepo;

/// Information about a single git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Absolute path to the worktree directory.
    pub path: PathBuf,
    /// Branch checked out in this worktree, if any.
    pub branch: Option<String>,
    /// HEAD commit SHA.
    pub head_commit: String,
}

/// Manages git worktrees for workspace isolation.
///
/// The manager operates relative to a main repository and places worktrees
/// in a configurable base directory (defaulting to a sibling directory of
/// the main repo named `<repo-name>-claudio-workspaces`).
///
/// Mutating operations share the [`GitRepo`] lock: git does not support
/// concurrent worktree operations on the same repository.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo: GitRepo,
    worktree_base: PathBuf,
}

impl WorktreeManager {
    /// Create a new `WorktreeManager` over an already-opened repository.
    ///
    /// If `worktree_base` is `None`, defaults to
    /// `../<repo-name>-claudio-workspaces/` relative to the repository.
    pub fn new(repo: GitRepo, worktree_base: Option<PathBuf>) -> Self {
        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo
                .path()
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-claudio-workspaces");
            repo.path()
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Self {
            repo,
            worktree_base,
        }
    }

    /// Return the base directory where worktrees are created.
    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// The underlying repository handle.
    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    /// Directory name for a branch, with `/` replaced for filesystem safety.
    pub fn dir_name_for_branch(branch: &str) -> String {
        branch.replace('/', "--")
    }

    /// Create a worktree checked out to `branch`.
    ///
    /// If the branch does not exist yet it is created at `base` (or at the
    /// current HEAD when `base` is `None`). This operation is **idempotent**:
    /// an existing worktree at the expected path with the expected branch is
    /// returned as-is.
    pub fn create_worktree(
        &self,
        branch: &str,
        base: Option<&str>,
    ) -> Result<WorktreeInfo, GitError> {
        let _lock = self.repo.lock();

        let worktree_path = self.worktree_base.join(Self::dir_name_for_branch(branch));

        // Check if this worktree already exists.
        if let Ok(existing) = self.find_worktree_by_path(&worktree_path) {
            if let Some(ref existing_branch) = existing.branch {
                if existing_branch == branch {
                    tracing::info!(
                        path = %worktree_path.display(),
                        branch = branch,
                        "worktree already exists, returning existing"
                    );
                    return Ok(existing);
                }
                return Err(GitError::BranchMismatch {
                    expected: branch.to_string(),
                    found: existing_branch.clone(),
                });
            }
            // Detached HEAD at the path -- treat as existing and return.
            tracing::info!(
                path = %worktree_path.display(),
                "worktree exists with detached HEAD, returning existing"
            );
            return Ok(existing);
        }

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| GitError::Command {
                message: format!(
                    "failed to create worktree base directory: {}",
                    self.worktree_base.display()
                ),
                source: e,
            })?;
        }

        let branch_exists = self.repo.branch_exists(branch)?;
        let path_str = worktree_path.to_string_lossy().to_string();

        let args: Vec<&str> = if branch_exists {
            vec!["worktree", "add", &path_str, branch]
        } else if let Some(base) = base {
            vec!["worktree", "add", "-b", branch, &path_str, base]
        } else {
            vec!["worktree", "add", "-b", branch, &path_str]
        };

        let output = std::process::Command::new("git")
            .args(&args)
            .current_dir(self.repo.path())
            .output()
            .map_err(|e| GitError::Command {
                message: "failed to run git worktree add".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(GitError::Exit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.find_worktree_by_path(&worktree_path)
    }

    /// Remove a worktree by its path.
    ///
    /// Removes the directory and unregisters it from git. A missing
    /// worktree is a no-op (idempotent).
    pub fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        let _lock = self.repo.lock();

        if self.find_worktree_by_path(path).is_err() {
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "directory exists but not registered as worktree, removing"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let path_str = path.to_string_lossy().to_string();
        let output = std::process::Command::new("git")
            .args(["worktree", "remove", "--force", &path_str])
            .current_dir(self.repo.path())
            .output()
            .map_err(|e| GitError::Command {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("is not a working tree") {
                return Ok(());
            }
            return Err(GitError::Exit {
                command: "worktree remove".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(())
    }

    /// List all worktrees associated with the main repository.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let output = std::process::Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(self.repo.path())
            .output()
            .map_err(|e| GitError::Command {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(GitError::Exit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_worktree_list(&stdout)
    }

    /// Prune stale worktree entries whose directories were removed
    /// externally.
    pub fn cleanup_stale(&self) -> Result<(), GitError> {
        let output = std::process::Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(self.repo.path())
            .output()
            .map_err(|e| GitError::Command {
                message: "failed to run git worktree prune".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(GitError::Exit {
                command: "worktree prune".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(())
    }

    /// Find a worktree by its path in the worktree list.
    fn find_worktree_by_path(&self, path: &Path) -> Result<WorktreeInfo, GitError> {
        let worktrees = self.list_worktrees()?;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        for wt in worktrees {
            let wt_canonical = wt.path.canonicalize().unwrap_or_else(|_| wt.path.clone());
            if wt_canonical == canonical {
                return Ok(wt);
            }
        }

        Err(GitError::ParseError(format!(
            "worktree not found at path: {}",
            path.display()
        )))
    }

    /// Best-effort cleanup of a partially created worktree directory.
    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(
                path = %path.display(),
                "cleaning up partial worktree directory"
            );
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.cleanup_stale();
    }
}

/// Parse the output of `git worktree list --porcelain` into workspace
/// entries.
///
/// The porcelain format is a sequence of blank-line-separated blocks,
/// one per worktree, each a list of `<key> <value>` (or bare-keyword)
/// lines. Only the keys this crate cares about are read; everything
/// else (`detached`, `prunable`, `locked`, ...) is ignored.
fn parse_worktree_list(output: &str) -> Result<Vec<WorktreeInfo>, GitError> {
    let mut worktrees = Vec::new();
    for block in output.split("\n\n").map(str::trim).filter(|b| !b.is_empty()) {
        if let Some(info) = parse_worktree_block(block)? {
            worktrees.push(info);
        }
    }
    Ok(worktrees)
}

/// Turn one porcelain block into a [`WorktreeInfo`].
///
/// Returns `Ok(None)` for bare entries: they have no HEAD and cannot
/// serve as a workspace. A block without a `worktree` path line is
/// malformed.
fn parse_worktree_block(block: &str) -> Result<Option<WorktreeInfo>, GitError> {
    let field = |key: &str| block.lines().find_map(|line| line.strip_prefix(key));

    let Some(path) = field("worktree ") else {
        return Err(GitError::ParseError(format!(
            "porcelain block without a worktree line: {block:?}"
        )));
    };
    let Some(head_commit) = field("HEAD ") else {
        return Ok(None);
    };
    let branch = field("branch ").map(|reference| {
        reference
            .strip_prefix("refs/heads/")
            .unwrap_or(reference)
            .to_string()
    });

    Ok(Some(WorktreeInfo {
        path: PathBuf::from(path),
        branch,
        head_commit: head_commit.to_string(),
    }))
}
