//! Group-aware readiness gating and group advancement.
//!
//! The scheduler is stateless over the session: it reads the plan's
//! execution order and the session's run-state and answers which tasks may
//! run right now. Plans without explicit groups fall back to raw
//! dependency-graph readiness.

use serde::Serialize;

use crate::session::Session;

/// Progress counts for one execution group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub claimed: usize,
    pub pending: usize,
}

impl GroupProgress {
    pub fn is_terminal(&self) -> bool {
        self.completed + self.failed == self.total
    }
}

/// Plan-wide progress, per group and overall.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanProgress {
    pub current_group: usize,
    pub groups: Vec<GroupProgress>,
    pub completed: usize,
    pub failed: usize,
    pub claimed: usize,
    pub pending: usize,
}

/// Compute plan-wide progress from the session run-state.
pub fn progress(session: &Session) -> PlanProgress {
    let plan = session.plan().clone();
    let completed = session.completed_tasks();
    let failed = session.failed_tasks();
    let assignments = session.assignments();

    let mut report = PlanProgress {
        current_group: session.current_group(),
        ..PlanProgress::default()
    };

    for group in &plan.execution_order {
        let mut gp = GroupProgress {
            total: group.len(),
            ..GroupProgress::default()
        };
        for id in group {
            if completed.contains(id) {
                gp.completed += 1;
            } else if failed.contains(id) {
                gp.failed += 1;
            } else if assignments.contains_key(id) {
                gp.claimed += 1;
            } else {
                gp.pending += 1;
            }
        }
        report.completed += gp.completed;
        report.failed += gp.failed;
        report.claimed += gp.claimed;
        report.pending += gp.pending;
        report.groups.push(gp);
    }

    report
}

/// IDs of tasks that are ready to run: members of the current execution
/// group whose dependencies are all completed and which are neither
/// claimed, completed, nor failed. Sorted by `(priority, id)` for
/// deterministic dispatch.
pub fn ready_tasks(session: &Session) -> Vec<String> {
    let plan = session.plan().clone();
    let completed = session.completed_tasks();
    let failed = session.failed_tasks();
    let assignments = session.assignments();

    let candidates: Vec<&str> = match plan.group(session.current_group()) {
        Some(group) => group.iter().map(String::as_str).collect(),
        // No explicit grouping (or the index ran past the end): fall back
        // to the raw dependency graph.
        None if plan.execution_order.is_empty() => {
            plan.tasks.iter().map(|t| t.id.as_str()).collect()
        }
        None => Vec::new(),
    };

    let mut ready: Vec<&str> = candidates
        .into_iter()
        .filter(|id| !completed.contains(*id))
        .filter(|id| !failed.contains(*id))
        .filter(|id| !assignments.contains_key(*id))
        .filter(|id| {
            plan.dependencies(id)
                .iter()
                .all(|dep| completed.contains(dep))
        })
        .collect();

    ready.sort_by_key(|id| {
        let priority = plan.task(id).map(|t| t.priority).unwrap_or_default();
        (priority, *id)
    });
    ready.into_iter().map(str::to_string).collect()
}

/// True when every task in the current group reached a terminal outcome.
/// A group index past the end of the plan counts as complete.
pub fn is_current_group_complete(session: &Session) -> bool {
    let plan = session.plan().clone();
    let Some(group) = plan.group(session.current_group()) else {
        return true;
    };
    let completed = session.completed_tasks();
    let failed = session.failed_tasks();
    group
        .iter()
        .all(|id| completed.contains(id) || failed.contains(id))
}

/// Advance the session's group index if the current group is complete.
/// Returns whether an advancement happened.
pub fn advance_group_if_complete(session: &Session) -> bool {
    if session.current_group() >= session.plan().group_count() {
        return false;
    }
    if !is_current_group_complete(session) {
        return false;
    }
    session.advance_group();
    true
}

/// Whether a finished group mixed successes and failures.
///
/// A task counts as a success when it completed with a non-zero verified
/// commit count; it counts as a failure when it is in the failed set or
/// completed with zero verified commits. Partial failure is a signal:
/// whether to halt, continue degraded, or run a revision pass is the
/// caller's policy.
pub fn has_partial_failure(session: &Session, group_index: usize) -> bool {
    let plan = session.plan().clone();
    let Some(group) = plan.group(group_index) else {
        return false;
    };
    let completed = session.completed_tasks();
    let failed = session.failed_tasks();

    let mut successes = 0usize;
    let mut failures = 0usize;
    for id in group {
        let commits = session.verified_commits(id).unwrap_or(0);
        if completed.contains(id) && commits > 0 {
            successes += 1;
        } else if failed.contains(id) || (completed.contains(id) && commits == 0) {
            failures += 1;
        }
    }
    successes > 0 && failures > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Complexity, Plan, Task};
    use std::sync::Arc;

    fn task(id: &str, deps: &[&str], priority: i32) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {id}"),
            description: String::new(),
            files: vec![],
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            priority,
            complexity: Complexity::Medium,
            no_code: false,
        }
    }

    /// Two groups: {a, b} then {c} (c depends on both).
    fn two_group_session() -> Session {
        let plan = Plan::new(
            "objective",
            vec![task("a", &[], 0), task("b", &[], 1), task("c", &["a", "b"], 0)],
        )
        .unwrap();
        Session::new(Arc::new(plan))
    }

    #[test]
    fn ready_tasks_are_gated_by_current_group() {
        let session = two_group_session();
        // Group 0: both a and b ready, c (group 1) is not.
        assert_eq!(ready_tasks(&session), vec!["a", "b"]);
    }

    #[test]
    fn ready_tasks_require_completed_dependencies() {
        let session = two_group_session();
        session.mark_completed("a");
        session.mark_completed("b");
        assert!(advance_group_if_complete(&session));

        let ready = ready_tasks(&session);
        assert_eq!(ready, vec!["c"]);
        for id in &ready {
            for dep in session.plan().dependencies(id) {
                assert!(session.is_completed(dep), "dependency {dep} not completed");
            }
        }
    }

    #[test]
    fn claimed_tasks_are_not_ready() {
        let session = two_group_session();
        session.assign("a", "instance-1");
        assert_eq!(ready_tasks(&session), vec!["b"]);
    }

    #[test]
    fn failed_dependency_blocks_dependent_forever() {
        let session = two_group_session();
        session.mark_completed("a");
        session.mark_failed("b");
        assert!(advance_group_if_complete(&session));
        // c's dependency b never completed; c is not ready.
        assert!(ready_tasks(&session).is_empty());
    }

    #[test]
    fn group_not_complete_while_work_remains() {
        let session = two_group_session();
        assert!(!is_current_group_complete(&session));
        session.mark_completed("a");
        assert!(!is_current_group_complete(&session));
        assert!(!advance_group_if_complete(&session));
        assert_eq!(session.current_group(), 0);
    }

    #[test]
    fn failures_count_toward_group_completion() {
        let session = two_group_session();
        session.mark_completed("a");
        session.mark_failed("b");
        assert!(is_current_group_complete(&session));
    }

    #[test]
    fn partial_failure_mixes_success_and_failure() {
        let session = two_group_session();
        session.mark_completed("a");
        session.record_verified_commits("a", 2);
        session.mark_failed("b");
        assert!(has_partial_failure(&session, 0));
    }

    #[test]
    fn all_failures_is_not_partial() {
        let session = two_group_session();
        session.mark_failed("a");
        session.mark_failed("b");
        assert!(!has_partial_failure(&session, 0));
    }

    #[test]
    fn completed_without_commits_counts_as_failure() {
        let session = two_group_session();
        session.mark_completed("a");
        session.record_verified_commits("a", 1);
        session.mark_completed("b");
        session.record_verified_commits("b", 0);
        assert!(has_partial_failure(&session, 0));
    }

    #[test]
    fn all_successes_is_not_partial() {
        let session = two_group_session();
        session.mark_completed("a");
        session.record_verified_commits("a", 1);
        session.mark_completed("b");
        session.record_verified_commits("b", 1);
        assert!(!has_partial_failure(&session, 0));
    }

    #[test]
    fn progress_counts_per_group_and_overall() {
        let session = two_group_session();
        session.mark_completed("a");
        session.assign("b", "instance-1");

        let report = progress(&session);
        assert_eq!(report.current_group, 0);
        assert_eq!(report.groups.len(), 2);

        let group0 = report.groups[0];
        assert_eq!(group0.total, 2);
        assert_eq!(group0.completed, 1);
        assert_eq!(group0.claimed, 1);
        assert!(!group0.is_terminal());

        let group1 = report.groups[1];
        assert_eq!(group1.total, 1);
        assert_eq!(group1.pending, 1);

        assert_eq!(report.completed, 1);
        assert_eq!(report.claimed, 1);
        assert_eq!(report.pending, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn terminal_group_progress() {
        let session = two_group_session();
        session.mark_completed("a");
        session.mark_failed("b");
        let report = progress(&session);
        assert!(report.groups[0].is_terminal());
        assert!(!report.groups[1].is_terminal());
    }

    #[test]
    fn exhausted_plan_reports_complete() {
        let session = two_group_session();
        for id in ["a", "b", "c"] {
            session.mark_completed(id);
        }
        assert!(advance_group_if_complete(&session));
        assert!(advance_group_if_complete(&session));
        // Past the last group: complete, but no further advancement.
        assert!(is_current_group_complete(&session));
        assert!(!advance_group_if_complete(&session));
        assert_eq!(session.current_group(), 2);
    }
}
