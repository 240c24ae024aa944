//! Session run-state: the mutable counterpart of an immutable [`Plan`].
//!
//! The session tracks which tasks completed or failed, who holds which
//! claim, verified commit counts, per-task workspaces, and consolidation
//! progress. It is mutated exclusively through the scheduler, verifier,
//! and consolidator paths; all readers go through the synchronized
//! accessors here.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::Plan;
use crate::report::AggregatedContext;
use crate::slug::short_session_id;

/// An isolated version-controlled working copy dedicated to one task or
/// one consolidation operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
}

/// Revision-pass bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevisionState {
    /// Outstanding issues driving the revision pass.
    pub issues: Vec<String>,
    pub round: u32,
}

/// Consolidation progress: branches created so far, review-request URLs,
/// and the context carried between groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationState {
    pub branches: Vec<String>,
    pub review_urls: Vec<String>,
    pub context: AggregatedContext,
}

/// Serializable point-in-time copy of a session's run-state, for status
/// surfaces and resumable front ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub current_group: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub assignments: HashMap<String, String>,
    pub verified_commits: HashMap<String, u32>,
    pub workspaces: HashMap<String, WorkspaceDescriptor>,
    pub revision: Option<RevisionState>,
    pub consolidation: Option<ConsolidationState>,
}

#[derive(Default)]
struct RunState {
    current_group: usize,
    completed: HashSet<String>,
    failed: HashSet<String>,
    /// task ID -> instance ID holding the claim.
    assignments: HashMap<String, String>,
    verified_commits: HashMap<String, u32>,
    workspaces: HashMap<String, WorkspaceDescriptor>,
    revision: Option<RevisionState>,
    consolidation: Option<ConsolidationState>,
}

/// A running session over one plan.
pub struct Session {
    id: Uuid,
    plan: Arc<Plan>,
    state: RwLock<RunState>,
}

impl Session {
    pub fn new(plan: Arc<Plan>) -> Self {
        Self::with_id(Uuid::new_v4(), plan)
    }

    pub fn with_id(id: Uuid, plan: Arc<Plan>) -> Self {
        Self {
            id,
            plan,
            state: RwLock::new(RunState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// First eight characters of the session ID, as used in branch names.
    pub fn short_id(&self) -> String {
        short_session_id(&self.id)
    }

    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    // -----------------------------------------------------------------
    // Group progression
    // -----------------------------------------------------------------

    pub fn current_group(&self) -> usize {
        self.read().current_group
    }

    /// Increment the current group index and return the new value.
    pub fn advance_group(&self) -> usize {
        let mut state = self.write();
        state.current_group += 1;
        state.current_group
    }

    // -----------------------------------------------------------------
    // Task outcomes
    // -----------------------------------------------------------------

    pub fn completed_tasks(&self) -> HashSet<String> {
        self.read().completed.clone()
    }

    pub fn failed_tasks(&self) -> HashSet<String> {
        self.read().failed.clone()
    }

    pub fn is_completed(&self, task_id: &str) -> bool {
        self.read().completed.contains(task_id)
    }

    pub fn is_failed(&self, task_id: &str) -> bool {
        self.read().failed.contains(task_id)
    }

    /// Whether the task reached a terminal outcome.
    pub fn is_terminal(&self, task_id: &str) -> bool {
        let state = self.read();
        state.completed.contains(task_id) || state.failed.contains(task_id)
    }

    /// Record a successful completion. Clears any claim so a task is never
    /// simultaneously assigned and terminal.
    pub fn mark_completed(&self, task_id: &str) {
        let mut state = self.write();
        state.assignments.remove(task_id);
        state.failed.remove(task_id);
        state.completed.insert(task_id.to_string());
    }

    /// Record a permanent failure with the same claim-clearing guarantee.
    pub fn mark_failed(&self, task_id: &str) {
        let mut state = self.write();
        state.assignments.remove(task_id);
        state.failed.insert(task_id.to_string());
    }

    // -----------------------------------------------------------------
    // Claims
    // -----------------------------------------------------------------

    /// Record which instance holds a task. Ignored (with a warning) for
    /// tasks that already reached a terminal outcome.
    pub fn assign(&self, task_id: &str, instance_id: &str) {
        let mut state = self.write();
        if state.completed.contains(task_id) || state.failed.contains(task_id) {
            tracing::warn!(
                task_id = %task_id,
                instance_id = %instance_id,
                "refusing to assign a terminal task"
            );
            return;
        }
        state
            .assignments
            .insert(task_id.to_string(), instance_id.to_string());
    }

    pub fn unassign(&self, task_id: &str) {
        self.write().assignments.remove(task_id);
    }

    pub fn assignment(&self, task_id: &str) -> Option<String> {
        self.read().assignments.get(task_id).cloned()
    }

    pub fn assignments(&self) -> HashMap<String, String> {
        self.read().assignments.clone()
    }

    // -----------------------------------------------------------------
    // Verified commits
    // -----------------------------------------------------------------

    pub fn record_verified_commits(&self, task_id: &str, count: u32) {
        self.write()
            .verified_commits
            .insert(task_id.to_string(), count);
    }

    pub fn verified_commits(&self, task_id: &str) -> Option<u32> {
        self.read().verified_commits.get(task_id).copied()
    }

    // -----------------------------------------------------------------
    // Workspaces
    // -----------------------------------------------------------------

    pub fn add_workspace(&self, task_id: &str, workspace: WorkspaceDescriptor) {
        self.write()
            .workspaces
            .insert(task_id.to_string(), workspace);
    }

    pub fn workspace(&self, task_id: &str) -> Option<WorkspaceDescriptor> {
        self.read().workspaces.get(task_id).cloned()
    }

    pub fn workspaces(&self) -> HashMap<String, WorkspaceDescriptor> {
        self.read().workspaces.clone()
    }

    // -----------------------------------------------------------------
    // Revision & consolidation
    // -----------------------------------------------------------------

    pub fn set_revision(&self, revision: RevisionState) {
        self.write().revision = Some(revision);
    }

    pub fn revision(&self) -> Option<RevisionState> {
        self.read().revision.clone()
    }

    pub fn record_consolidation_branch(&self, branch: &str) {
        self.write()
            .consolidation
            .get_or_insert_with(ConsolidationState::default)
            .branches
            .push(branch.to_string());
    }

    pub fn consolidation_branches(&self) -> Vec<String> {
        self.read()
            .consolidation
            .as_ref()
            .map(|c| c.branches.clone())
            .unwrap_or_default()
    }

    pub fn record_review_url(&self, url: &str) {
        self.write()
            .consolidation
            .get_or_insert_with(ConsolidationState::default)
            .review_urls
            .push(url.to_string());
    }

    pub fn review_urls(&self) -> Vec<String> {
        self.read()
            .consolidation
            .as_ref()
            .map(|c| c.review_urls.clone())
            .unwrap_or_default()
    }

    pub fn merge_consolidation_context(&self, context: &AggregatedContext) {
        self.write()
            .consolidation
            .get_or_insert_with(ConsolidationState::default)
            .context
            .merge(context);
    }

    pub fn consolidation(&self) -> Option<ConsolidationState> {
        self.read().consolidation.clone()
    }

    /// Point-in-time copy of the whole run-state. Task ID lists are
    /// sorted so snapshots compare and serialise deterministically.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.read();
        let mut completed: Vec<String> = state.completed.iter().cloned().collect();
        completed.sort_unstable();
        let mut failed: Vec<String> = state.failed.iter().cloned().collect();
        failed.sort_unstable();
        SessionSnapshot {
            session_id: self.id,
            current_group: state.current_group,
            completed,
            failed,
            assignments: state.assignments.clone(),
            verified_commits: state.verified_commits.clone(),
            workspaces: state.workspaces.clone(),
            revision: state.revision.clone(),
            consolidation: state.consolidation.clone(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RunState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RunState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Complexity, Task};

    fn plan() -> Arc<Plan> {
        let tasks = vec![
            Task {
                id: "a".into(),
                title: "A".into(),
                description: String::new(),
                files: vec![],
                depends_on: vec![],
                priority: 0,
                complexity: Complexity::Medium,
                no_code: false,
            },
            Task {
                id: "b".into(),
                title: "B".into(),
                description: String::new(),
                files: vec![],
                depends_on: vec!["a".into()],
                priority: 0,
                complexity: Complexity::Medium,
                no_code: false,
            },
        ];
        Arc::new(Plan::new("objective", tasks).unwrap())
    }

    #[test]
    fn short_id_is_stable_prefix() {
        let session = Session::new(plan());
        let short = session.short_id();
        assert_eq!(short.len(), 8);
        assert!(session.id().simple().to_string().starts_with(&short));
    }

    #[test]
    fn group_advancement() {
        let session = Session::new(plan());
        assert_eq!(session.current_group(), 0);
        assert_eq!(session.advance_group(), 1);
        assert_eq!(session.current_group(), 1);
    }

    #[test]
    fn terminal_outcome_clears_assignment() {
        let session = Session::new(plan());
        session.assign("a", "instance-1");
        assert_eq!(session.assignment("a").as_deref(), Some("instance-1"));

        session.mark_completed("a");
        assert!(session.is_completed("a"));
        assert!(session.assignment("a").is_none());

        // A terminal task cannot be re-assigned.
        session.assign("a", "instance-2");
        assert!(session.assignment("a").is_none());
    }

    #[test]
    fn failure_is_terminal_too() {
        let session = Session::new(plan());
        session.assign("b", "instance-1");
        session.mark_failed("b");
        assert!(session.is_failed("b"));
        assert!(session.is_terminal("b"));
        assert!(session.assignment("b").is_none());
    }

    #[test]
    fn verified_commit_counts() {
        let session = Session::new(plan());
        assert_eq!(session.verified_commits("a"), None);
        session.record_verified_commits("a", 3);
        assert_eq!(session.verified_commits("a"), Some(3));
    }

    #[test]
    fn consolidation_state_accumulates() {
        let session = Session::new(plan());
        assert!(session.consolidation().is_none());

        session.record_consolidation_branch("claudio/swarm-ab12cd34-group-1");
        session.record_consolidation_branch("claudio/swarm-ab12cd34-group-2");
        session.record_review_url("https://example.test/pr/1");

        assert_eq!(session.consolidation_branches().len(), 2);
        assert_eq!(session.review_urls().len(), 1);
    }

    #[test]
    fn revision_state_round_trips() {
        let session = Session::new(plan());
        assert!(session.revision().is_none());
        session.set_revision(RevisionState {
            issues: vec!["flaky test in auth module".into()],
            round: 1,
        });
        let revision = session.revision().unwrap();
        assert_eq!(revision.round, 1);
        assert_eq!(revision.issues.len(), 1);
    }

    #[test]
    fn workspace_bookkeeping() {
        let session = Session::new(plan());
        let ws = WorkspaceDescriptor {
            path: PathBuf::from("/tmp/ws/a"),
            branch: "claudio/swarm-ab12cd34/a".into(),
            base_branch: "main".into(),
        };
        session.add_workspace("a", ws.clone());
        assert_eq!(session.workspace("a"), Some(ws));
        assert!(session.workspace("b").is_none());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let session = Session::new(plan());
        session.mark_completed("a");
        session.record_verified_commits("a", 2);
        session.assign("b", "instance-1");
        session.advance_group();
        session.record_consolidation_branch("claudio/swarm-ab12cd34-group-1");

        let snapshot = session.snapshot();
        assert_eq!(snapshot.current_group, 1);
        assert_eq!(snapshot.completed, vec!["a"]);
        assert_eq!(snapshot.assignments.get("b").map(String::as_str), Some("instance-1"));

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
