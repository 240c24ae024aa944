//! Task-completion verification.
//!
//! After an instance reports a task done, the verifier reconciles the
//! workspace's filesystem-visible side effects (commits on the task
//! branch, or a sentinel completion report) against the expected contract
//! and decides whether the task is complete, retries, or fails
//! permanently.

pub mod sentinel;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use claudio_git::GitRepo;

use crate::config::CoreConfig;
use crate::events::{Event, EventBus};
use crate::plan::Task;
use crate::report::CompletionReport;
use crate::session::WorkspaceDescriptor;

pub use sentinel::{MAX_SEARCH_DEPTH, find_completion_report};

/// Verifier tuning.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// When false, every task verifies successfully.
    pub require_verified_commits: bool,
    /// Default retry budget; can be overridden per task through the
    /// tracker.
    pub max_task_retries: u32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            require_verified_commits: true,
            max_task_retries: 3,
        }
    }
}

impl From<&CoreConfig> for VerifyConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            require_verified_commits: config.require_verified_commits,
            max_task_retries: config.max_task_retries,
        }
    }
}

/// Per-task retry bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Retries granted so far. Non-decreasing, bounded by the effective
    /// maximum.
    pub attempts: u32,
    /// Per-task override of the retry budget.
    pub max_override: Option<u32>,
    /// Every commit count the verifier observed, in order, including
    /// counts recorded on success. The surrounding UI renders the series.
    pub observed_commits: Vec<u32>,
}

/// Shared retry tracker.
#[derive(Debug, Default)]
pub struct RetryTracker {
    inner: Mutex<HashMap<String, RetryState>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, task_id: &str) -> Option<RetryState> {
        self.lock().get(task_id).cloned()
    }

    pub fn attempts(&self, task_id: &str) -> u32 {
        self.lock().get(task_id).map(|s| s.attempts).unwrap_or(0)
    }

    /// Record an observed commit count for the task's series.
    pub fn record_commits(&self, task_id: &str, count: u32) {
        self.lock()
            .entry(task_id.to_string())
            .or_default()
            .observed_commits
            .push(count);
    }

    /// Grant one more retry and return the new attempt count.
    pub fn increment(&self, task_id: &str) -> u32 {
        let mut inner = self.lock();
        let state = inner.entry(task_id.to_string()).or_default();
        state.attempts += 1;
        state.attempts
    }

    /// Override the retry budget for one task.
    pub fn set_max_retries(&self, task_id: &str, max: u32) {
        self.lock().entry(task_id.to_string()).or_default().max_override = Some(max);
    }

    /// Effective retry budget for a task.
    pub fn max_retries_for(&self, task_id: &str, default: u32) -> u32 {
        self.lock()
            .get(task_id)
            .and_then(|s| s.max_override)
            .unwrap_or(default)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RetryState>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Outcome of verifying one task attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    /// The work is acceptable. `commit_count` is zero for no-code tasks
    /// and completion-file overrides.
    Success {
        commit_count: u32,
        report: Option<CompletionReport>,
    },
    /// No commits and no completion file; the task re-enters the queue.
    NeedsRetry { attempt: u32, max_retries: u32 },
    /// Retry budget exhausted.
    Failed { attempts: u32, reason: String },
}

impl VerifyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn needs_retry(&self) -> bool {
        matches!(self, Self::NeedsRetry { .. })
    }
}

/// The task-completion verifier.
pub struct Verifier {
    repo: GitRepo,
    bus: Arc<EventBus>,
    config: VerifyConfig,
    tracker: RetryTracker,
}

impl Verifier {
    pub fn new(repo: GitRepo, bus: Arc<EventBus>, config: VerifyConfig) -> Self {
        Self {
            repo,
            bus,
            config,
            tracker: RetryTracker::new(),
        }
    }

    pub fn tracker(&self) -> &RetryTracker {
        &self.tracker
    }

    /// Decide whether a task's work is acceptable.
    ///
    /// 1. Verification disabled: success.
    /// 2. No-code task: success.
    /// 3. Count commits between the workspace's base branch and its
    ///    branch tip.
    ///    - Count unavailable: warn and succeed; failing to count is not
    ///      the task's fault.
    ///    - Commits > 0: success with that count.
    ///    - Commits = 0: search for a completion report; a `complete`
    ///      report documents an intentionally no-code task and succeeds.
    ///      Otherwise retry while the budget allows, then fail.
    pub fn verify_task(&self, task: &Task, workspace: &WorkspaceDescriptor) -> VerifyOutcome {
        if !self.config.require_verified_commits {
            return VerifyOutcome::Success {
                commit_count: 0,
                report: self.read_report(workspace),
            };
        }

        if task.no_code {
            tracing::info!(task_id = %task.id, "no-code task, skipping commit check");
            return VerifyOutcome::Success {
                commit_count: 0,
                report: self.read_report(workspace),
            };
        }

        let count = match self
            .repo
            .commit_count(&workspace.base_branch, &workspace.branch)
        {
            Ok(count) => count,
            Err(e) => {
                // Failing to count is not the task's fault.
                tracing::warn!(task_id = %task.id, error = %e, "commit count unavailable");
                self.bus.publish(&Event::VerificationWarning {
                    task_id: task.id.clone(),
                    message: e.to_string(),
                });
                return VerifyOutcome::Success {
                    commit_count: 0,
                    report: self.read_report(workspace),
                };
            }
        };

        self.tracker.record_commits(&task.id, count);

        if count > 0 {
            return VerifyOutcome::Success {
                commit_count: count,
                report: self.read_report(workspace),
            };
        }

        // Zero commits: a completion report with status `complete`
        // overrides the commit requirement.
        if let Some((path, report)) = find_completion_report(&workspace.path) {
            if report.is_complete() {
                tracing::info!(
                    task_id = %task.id,
                    report = %path.display(),
                    "completion report overrides missing commits"
                );
                return VerifyOutcome::Success {
                    commit_count: 0,
                    report: Some(report),
                };
            }
            tracing::info!(
                task_id = %task.id,
                status = %report.status,
                "completion report present but not complete"
            );
        }

        let max_retries = self
            .tracker
            .max_retries_for(&task.id, self.config.max_task_retries);
        let attempts = self.tracker.attempts(&task.id);

        if attempts < max_retries {
            let attempt = self.tracker.increment(&task.id);
            self.bus.publish(&Event::VerificationRetry {
                task_id: task.id.clone(),
                attempt,
                max_retries,
            });
            return VerifyOutcome::NeedsRetry {
                attempt,
                max_retries,
            };
        }

        self.bus.publish(&Event::VerificationFailed {
            task_id: task.id.clone(),
            attempts,
            reason: "no_commits".to_string(),
        });
        VerifyOutcome::Failed {
            attempts,
            reason: "no_commits".to_string(),
        }
    }

    fn read_report(&self, workspace: &WorkspaceDescriptor) -> Option<CompletionReport> {
        find_completion_report(&workspace.path).map(|(_, report)| report)
    }
}
