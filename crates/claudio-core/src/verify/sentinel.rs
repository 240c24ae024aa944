//! Completion-file discovery.
//!
//! Workers may change directory mid-task, so a completion report is not
//! guaranteed to sit at the workspace root. Discovery takes a fast path at
//! the root and falls back to a recursive walk bounded by depth and a
//! skip-list of directory names. Both bounds are load-bearing: the walk
//! must stay cheap, and sub-repository internals could contain stray
//! completion files from unrelated work.

use std::path::{Path, PathBuf};

use crate::report::{CompletionReport, REVISION_COMPLETE_FILE, TASK_COMPLETE_FILE};

/// Maximum directory depth below the workspace root searched for
/// completion files.
pub const MAX_SEARCH_DEPTH: usize = 5;

/// Directory names never descended into: version-control internals,
/// dependency caches, build outputs, and package bundles.
const SKIP_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "vendor",
    "bower_components",
    "Pods",
    ".venv",
    "venv",
    "__pycache__",
    ".gradle",
    "target",
    "build",
    "dist",
    "out",
    ".next",
    ".nuxt",
    ".cache",
];

/// Find a completion report in the workspace.
///
/// Checks the root first, then walks descendants up to
/// [`MAX_SEARCH_DEPTH`] levels deep. Either the task-complete or the
/// revision-complete file counts. Unparseable candidates are skipped and
/// the walk continues.
pub fn find_completion_report(root: &Path) -> Option<(PathBuf, CompletionReport)> {
    if let Some(found) = check_dir(root) {
        return Some(found);
    }
    walk(root, 1)
}

/// Check one directory for either completion file.
fn check_dir(dir: &Path) -> Option<(PathBuf, CompletionReport)> {
    for name in [TASK_COMPLETE_FILE, REVISION_COMPLETE_FILE] {
        let candidate = dir.join(name);
        if let Some(report) = read_report(&candidate) {
            return Some((candidate, report));
        }
    }
    None
}

/// Depth-first walk in lexicographic order for deterministic discovery.
/// `depth` is the directory level of the children being visited.
fn walk(dir: &Path, depth: usize) -> Option<(PathBuf, CompletionReport)> {
    if depth > MAX_SEARCH_DEPTH {
        return None;
    }

    let entries = std::fs::read_dir(dir).ok()?;
    let mut subdirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    subdirs.sort();

    for subdir in subdirs {
        let name = subdir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if SKIP_DIRS.contains(&name) || is_sub_repository(&subdir) {
            continue;
        }
        if let Some(found) = check_dir(&subdir) {
            return Some(found);
        }
        if let Some(found) = walk(&subdir, depth + 1) {
            return Some(found);
        }
    }
    None
}

/// Parse a completion report, returning `None` for missing or invalid
/// files.
fn read_report(path: &Path) -> Option<CompletionReport> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<CompletionReport>(&content) {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "skipping unparseable completion file"
            );
            None
        }
    }
}

/// A directory whose `.git` entry is a regular file starting with
/// `gitdir:` is a checkout of another repository; its contents must not be
/// searched for completion files.
fn is_sub_repository(dir: &Path) -> bool {
    let git_entry = dir.join(".git");
    if git_entry.is_dir() {
        // An independent clone nested inside the workspace.
        return true;
    }
    if git_entry.is_file() {
        if let Ok(content) = std::fs::read_to_string(&git_entry) {
            return content.trim_start().starts_with("gitdir:");
        }
    }
    false
}
