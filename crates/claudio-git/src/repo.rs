//! Repository-level git operations.
//!
//! [`GitRepo`] wraps the subprocess invocations the orchestration core
//! relies on: branch bookkeeping, commit counting, cherry-picking with
//! conflict detection, committing, pushing, and submodule handling.
//! Worktree management lives in [`crate::worktree`].

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::GitError;

/// Handle to a git repository.
///
/// Operations that mutate the shared object store (branch creation,
/// cherry-picks, commits, pushes) are serialised through an internal mutex.
/// Read-only queries run unlocked. Clones share the same lock so that a
/// [`crate::worktree::WorktreeManager`] built from this handle participates
/// in the same serialisation.
#[derive(Debug)]
pub struct GitRepo {
    repo_path: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for GitRepo {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl GitRepo {
    /// Open a repository at `repo_path`.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::NotAGitRepo`] if the path is not inside a git
    /// repository.
    pub fn open(repo_path: impl Into<PathBuf>) -> Result<Self, GitError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_path)
            .output()
            .map_err(|e| GitError::Command {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(GitError::NotAGitRepo(repo_path));
        }

        Ok(Self {
            repo_path,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Path of the main repository.
    pub fn path(&self) -> &Path {
        &self.repo_path
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.git_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a git command in `dir` without inspecting the exit status.
    fn run(&self, dir: &Path, args: &[&str]) -> Result<Output, GitError> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| GitError::Command {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })
    }

    /// Run a git command in `dir` and return trimmed stdout, or
    /// [`GitError::Exit`] with the captured stderr.
    fn run_checked(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = self.run(dir, args)?;
        if !output.status.success() {
            return Err(GitError::Exit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Discover the repository's main branch by verifying `main`, then
    /// `master`.
    pub fn main_branch(&self) -> Result<String, GitError> {
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate)? {
                return Ok(candidate.to_string());
            }
        }
        Err(GitError::NoMainBranch)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let output = self.run(
            &self.repo_path,
            &["rev-parse", "--verify", &format!("refs/heads/{name}")],
        )?;
        Ok(output.status.success())
    }

    /// Create a branch at `base` without checking it out.
    pub fn create_branch(&self, name: &str, base: &str) -> Result<(), GitError> {
        let _lock = self.lock();
        self.run_checked(&self.repo_path, &["branch", name, base])?;
        Ok(())
    }

    /// Force-delete a local branch. Idempotent: a missing branch is not an
    /// error.
    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let _lock = self.lock();
        let output = self.run(&self.repo_path, &["branch", "-D", name])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(GitError::Exit {
                command: "branch -D".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(())
    }

    /// List local branch names.
    pub fn list_branches(&self) -> Result<Vec<String>, GitError> {
        let stdout = self.run_checked(
            &self.repo_path,
            &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
        )?;
        Ok(stdout.lines().map(|l| l.trim().to_string()).collect())
    }

    /// Resolve a ref to its commit SHA.
    pub fn head_commit(&self, reference: &str) -> Result<String, GitError> {
        let sha = self.run_checked(&self.repo_path, &["rev-parse", reference])?;
        if sha.is_empty() {
            return Err(GitError::BranchNotFound(reference.to_string()));
        }
        Ok(sha)
    }

    /// Count commits reachable from `head` but not from `base`.
    ///
    /// # Errors
    ///
    /// Returns [`GitError::CommitCountUnavailable`] when the refs cannot be
    /// compared. Callers treat that as a warning, not as a task failure.
    pub fn commit_count(&self, base: &str, head: &str) -> Result<u32, GitError> {
        let range = format!("{base}..{head}");
        let output = self.run(&self.repo_path, &["rev-list", "--count", &range])?;
        if !output.status.success() {
            return Err(GitError::CommitCountUnavailable {
                base: base.to_string(),
                head: head.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<u32>()
            .map_err(|_| GitError::CommitCountUnavailable {
                base: base.to_string(),
                head: head.to_string(),
                stderr: format!("unparseable rev-list output: {stdout:?}"),
            })
    }

    /// List files changed between two refs.
    pub fn changed_files(&self, base: &str, head: &str) -> Result<Vec<String>, GitError> {
        let range = format!("{base}..{head}");
        let stdout = self.run_checked(&self.repo_path, &["diff", "--name-only", &range])?;
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// List files with unresolved conflicts in a working copy.
    pub fn conflicted_files(&self, workdir: &Path) -> Result<Vec<String>, GitError> {
        let stdout =
            self.run_checked(workdir, &["diff", "--name-only", "--diff-filter=U"])?;
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// List commits between `base` and `head` in application order
    /// (oldest first).
    pub fn commits_in_range(&self, base: &str, head: &str) -> Result<Vec<String>, GitError> {
        let range = format!("{base}..{head}");
        let stdout =
            self.run_checked(&self.repo_path, &["rev-list", "--reverse", &range])?;
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Cherry-pick the commits between `base` and `source_branch` onto the
    /// branch checked out in `workdir`, in order.
    ///
    /// Returns the SHAs that were picked. Stops at the first conflict with
    /// [`GitError::CherryPickConflict`]; the conflicted state is left in
    /// place so the caller can decide whether to abort or preserve it.
    pub fn cherry_pick_range(
        &self,
        workdir: &Path,
        base: &str,
        source_branch: &str,
    ) -> Result<Vec<String>, GitError> {
        let commits = self.commits_in_range(base, source_branch)?;
        let _lock = self.lock();

        let mut picked = Vec::with_capacity(commits.len());
        for commit in commits {
            self.cherry_pick_one(workdir, &commit, source_branch)?;
            picked.push(commit);
        }
        Ok(picked)
    }

    /// Cherry-pick a single commit. Caller must hold the git lock.
    fn cherry_pick_one(
        &self,
        workdir: &Path,
        commit: &str,
        source_branch: &str,
    ) -> Result<(), GitError> {
        let output = self.run(workdir, &["cherry-pick", commit])?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        let files = self.conflicted_files(workdir).unwrap_or_default();
        if !files.is_empty()
            || stderr.contains("CONFLICT")
            || stdout.contains("CONFLICT")
            || stderr.contains("could not apply")
        {
            return Err(GitError::CherryPickConflict {
                branch: source_branch.to_string(),
                commit: commit.to_string(),
                files,
                raw_output: format!("{stdout}\n{stderr}").trim().to_string(),
            });
        }

        Err(GitError::Exit {
            command: format!("cherry-pick {commit}"),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }

    /// Abort an in-progress cherry-pick in `workdir`. Idempotent: succeeds
    /// when no cherry-pick is in progress.
    pub fn cherry_pick_abort(&self, workdir: &Path) -> Result<(), GitError> {
        let _lock = self.lock();
        let output = self.run(workdir, &["cherry-pick", "--abort"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("no cherry-pick") {
                return Ok(());
            }
            return Err(GitError::Exit {
                command: "cherry-pick --abort".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }
        Ok(())
    }

    /// Continue an in-progress cherry-pick in `workdir` after conflicts
    /// have been resolved.
    pub fn cherry_pick_continue(&self, workdir: &Path) -> Result<(), GitError> {
        let _lock = self.lock();
        self.run_checked(workdir, &["-c", "core.editor=true", "cherry-pick", "--continue"])?;
        Ok(())
    }

    /// Stage and commit everything in a working copy.
    ///
    /// Returns `Ok(true)` if a commit was created, `Ok(false)` if there was
    /// nothing to commit (idempotent).
    pub fn commit_all(&self, workdir: &Path, message: &str) -> Result<bool, GitError> {
        let _lock = self.lock();

        // Make sure commits work even when no identity is inherited.
        let _ = self.run(workdir, &["config", "user.email", "claudio@localhost"]);
        let _ = self.run(workdir, &["config", "user.name", "claudio"]);

        self.run_checked(workdir, &["add", "-A"])?;

        let status = self.run_checked(workdir, &["status", "--porcelain"])?;
        if status.is_empty() {
            return Ok(false);
        }

        self.run_checked(workdir, &["commit", "-m", message])?;
        Ok(true)
    }

    /// Push a branch to `origin`, with force-with-lease semantics when
    /// `force` is requested.
    pub fn push_branch(&self, branch: &str, force: bool) -> Result<(), GitError> {
        let _lock = self.lock();
        let refspec = format!("{branch}:{branch}");
        let mut args = vec!["push"];
        if force {
            args.push("--force-with-lease");
        }
        args.push("origin");
        args.push(&refspec);
        self.run_checked(&self.repo_path, &args)?;
        Ok(())
    }

    /// List submodule paths registered in the repository.
    pub fn list_submodules(&self) -> Result<Vec<String>, GitError> {
        let output = self.run(&self.repo_path, &["submodule", "status"])?;
        if !output.status.success() {
            // A repository without submodules reports success with empty
            // output; a hard failure here means git itself is unhappy.
            return Err(GitError::Exit {
                command: "submodule status".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(str::to_string)
            .collect())
    }

    /// Recursively initialise submodules in a working copy.
    pub fn init_submodules(&self, workdir: &Path) -> Result<(), GitError> {
        let _lock = self.lock();
        self.run_checked(workdir, &["submodule", "update", "--init", "--recursive"])?;
        Ok(())
    }
}
