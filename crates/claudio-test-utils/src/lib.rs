//! Shared test utilities for claudio integration tests.
//!
//! Provides temporary git repositories (built by shelling out to `git`,
//! mirroring how the production code drives git) and a tracing init helper
//! for debugging test runs with `RUST_LOG`.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Initialise tracing for a test binary. Safe to call more than once.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Run a git command in `dir` and panic with the captured stderr on failure.
pub fn git_ok(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed to spawn: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create a temporary git repository with an initial commit on `main`.
///
/// Returns the TempDir (must be held alive) and the repo path.
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    // `--initial-branch` needs git >= 2.28; fall back to renaming.
    let init = Command::new("git")
        .args(["init", "--initial-branch=main"])
        .current_dir(&repo_path)
        .output()
        .expect("failed to run git init");
    if !init.status.success() {
        git_ok(&repo_path, &["init"]);
    }

    git_ok(&repo_path, &["config", "user.email", "test@claudio.dev"]);
    git_ok(&repo_path, &["config", "user.name", "Claudio Test"]);

    std::fs::write(repo_path.join("README.md"), "# Test repo\n")
        .expect("failed to write README");
    git_ok(&repo_path, &["add", "."]);
    git_ok(&repo_path, &["commit", "-m", "Initial commit"]);

    // Normalise the branch name for repos created by an older git.
    let current = git_ok(&repo_path, &["branch", "--show-current"]);
    if current != "main" {
        git_ok(&repo_path, &["branch", "-m", &current, "main"]);
    }

    (dir, repo_path)
}

/// Write `content` to `relpath` inside the repo and commit it.
pub fn commit_file(repo_path: &Path, relpath: &str, content: &str, message: &str) {
    let full = repo_path.join(relpath);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).expect("failed to create parent dirs");
    }
    std::fs::write(&full, content).expect("failed to write file");
    git_ok(repo_path, &["add", relpath]);
    git_ok(repo_path, &["commit", "-m", message]);
}

/// Create a bare repository and register it as `origin` of `repo_path`,
/// for tests that exercise pushing.
pub fn add_bare_origin(repo_path: &Path) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let bare_path = dir.path().to_path_buf();
    git_ok(&bare_path, &["init", "--bare"]);
    git_ok(
        repo_path,
        &["remote", "add", "origin", &bare_path.to_string_lossy()],
    );
    (dir, bare_path)
}
