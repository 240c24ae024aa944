//! Consolidation engine: per-group branch integration and final
//! review-request emission.
//!
//! After each group completes, the consolidator creates a consolidation
//! branch from the correct base, cherry-picks the group's task branches
//! onto it in execution order, records any merge conflicts as structured
//! descriptors, aggregates the group's worker context, and writes a group
//! report file. On the final group it opens review requests: one per group
//! branch in stacked mode (each based on the previous), or a single one
//! from main.

pub mod review;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use claudio_git::{GitError, GitRepo, WorktreeManager};

use crate::config::{ConsolidationMode, CoreConfig, WORKFLOW_TAG};
use crate::events::{Event, EventBus};
use crate::report::{
    AggregatedContext, CompletionReport, ConflictDescriptor, GROUP_REPORT_FILE,
    GroupConsolidationReport, GroupStatus,
};
use crate::session::Session;

pub use review::{GhCliRequester, ReviewRequest, ReviewRequester};

/// What to do when a cherry-pick conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Stop the group and surface the conflicts for human resolution.
    #[default]
    Stop,
    /// Abort the cherry-pick, skip the task, and report it in the group
    /// report.
    Skip,
}

/// Consolidator tuning.
#[derive(Debug, Clone)]
pub struct ConsolidatorConfig {
    pub mode: ConsolidationMode,
    pub policy: ConflictPolicy,
    /// Leading branch segment, typically the organisation name.
    pub branch_prefix: String,
    pub draft_requests: bool,
    pub request_labels: Vec<String>,
    /// Push consolidation branches (force-with-lease) before opening
    /// review requests.
    pub push_branches: bool,
}

impl From<&CoreConfig> for ConsolidatorConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            mode: config.consolidation_mode,
            policy: ConflictPolicy::default(),
            branch_prefix: config.branch_prefix.clone(),
            draft_requests: config.draft_requests,
            request_labels: config.request_labels.clone(),
            push_branches: !config.dry_run,
        }
    }
}

/// Result of consolidating one group.
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub branch: String,
    pub base_branch: String,
    pub workspace_path: PathBuf,
    pub consolidated_tasks: Vec<String>,
    pub conflicts: Vec<ConflictDescriptor>,
    pub report: GroupConsolidationReport,
    /// The auxiliary working copy was left in place (conflicts need
    /// inspection).
    pub workspace_preserved: bool,
}

impl GroupOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// The consolidation engine.
pub struct Consolidator {
    repo: GitRepo,
    worktrees: WorktreeManager,
    bus: Arc<EventBus>,
    config: ConsolidatorConfig,
}

impl Consolidator {
    pub fn new(
        repo: GitRepo,
        worktrees: WorktreeManager,
        bus: Arc<EventBus>,
        config: ConsolidatorConfig,
    ) -> Self {
        Self {
            repo,
            worktrees,
            bus,
            config,
        }
    }

    /// Name of the consolidation branch for a group:
    /// `<prefix>/<tag>-<short-session>-group-<n+1>`, without the group
    /// suffix in single mode (one shared branch).
    pub fn consolidation_branch_name(&self, session: &Session, group_index: usize) -> String {
        let prefix = &self.config.branch_prefix;
        let short = session.short_id();
        match self.config.mode {
            ConsolidationMode::Single => format!("{prefix}/{WORKFLOW_TAG}-{short}"),
            ConsolidationMode::Stacked => {
                format!("{prefix}/{WORKFLOW_TAG}-{short}-group-{}", group_index + 1)
            }
        }
    }

    /// Base branch for a group's consolidation: main for group 0 and for
    /// single mode; the previous group's consolidation branch otherwise.
    fn base_branch_for(&self, session: &Session, group_index: usize) -> Result<String> {
        match self.config.mode {
            ConsolidationMode::Single => Ok(self.repo.main_branch()?),
            ConsolidationMode::Stacked if group_index == 0 => Ok(self.repo.main_branch()?),
            ConsolidationMode::Stacked => session
                .consolidation_branches()
                .get(group_index - 1)
                .cloned()
                .with_context(|| {
                    format!("no consolidation branch recorded for group {}", group_index - 1)
                }),
        }
    }

    /// Consolidate one completed group.
    ///
    /// `reports` maps task IDs to their completion reports, used for the
    /// aggregated group context. Cancellation between cherry-picks removes
    /// the auxiliary working copy unless the group already hit a conflict,
    /// in which case the copy is preserved for inspection.
    pub fn consolidate_group(
        &self,
        session: &Session,
        group_index: usize,
        reports: &HashMap<String, CompletionReport>,
        cancel: &CancellationToken,
    ) -> Result<GroupOutcome> {
        let plan = session.plan().clone();
        let group: Vec<String> = plan
            .group(group_index)
            .with_context(|| format!("plan has no group {group_index}"))?
            .to_vec();

        let base = self.base_branch_for(session, group_index)?;
        let branch = self.consolidation_branch_name(session, group_index);

        tracing::info!(
            group = group_index,
            branch = %branch,
            base = %base,
            tasks = group.len(),
            "starting group consolidation"
        );

        let worktree = self.worktrees.create_worktree(&branch, Some(&base))?;
        let workspace_path = worktree.path.clone();

        let mut consolidated: Vec<String> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut conflicts: Vec<ConflictDescriptor> = Vec::new();
        let mut cancelled = false;

        for task_id in &group {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            if !session.is_completed(task_id) {
                tracing::info!(task_id = %task_id, "task did not complete, excluded from consolidation");
                skipped.push(task_id.clone());
                continue;
            }
            let Some(task_ws) = session.workspace(task_id) else {
                tracing::warn!(task_id = %task_id, "completed task has no workspace record");
                skipped.push(task_id.clone());
                continue;
            };

            match self.repo.cherry_pick_range(
                &workspace_path,
                &task_ws.base_branch,
                &task_ws.branch,
            ) {
                Ok(picked) => {
                    tracing::info!(
                        task_id = %task_id,
                        commits = picked.len(),
                        "cherry-picked task branch"
                    );
                    consolidated.push(task_id.clone());
                }
                Err(GitError::CherryPickConflict {
                    branch: source,
                    commit,
                    files,
                    raw_output,
                }) => {
                    tracing::warn!(
                        task_id = %task_id,
                        commit = %commit,
                        files = files.len(),
                        "cherry-pick conflict"
                    );
                    // Raw git output is kept out of the structured report
                    // but preserved for diagnostics.
                    tracing::debug!(raw = %raw_output, "conflict subprocess output");

                    let task_title = plan
                        .task(task_id)
                        .map(|t| t.title.clone())
                        .unwrap_or_default();
                    conflicts.push(ConflictDescriptor {
                        task_id: task_id.clone(),
                        task_title,
                        branch: source,
                        commit,
                        files,
                        workspace: workspace_path.clone(),
                    });

                    match self.config.policy {
                        ConflictPolicy::Stop => break,
                        ConflictPolicy::Skip => {
                            self.repo
                                .cherry_pick_abort(&workspace_path)
                                .context("failed to abort conflicted cherry-pick")?;
                            skipped.push(task_id.clone());
                        }
                    }
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("cherry-pick of task {task_id} failed"));
                }
            }
        }

        if cancelled {
            let _ = self.repo.cherry_pick_abort(&workspace_path);
            if conflicts.is_empty() {
                self.worktrees.remove_worktree(&workspace_path)?;
            }
            bail!("consolidation of group {group_index} cancelled");
        }

        let status = if conflicts.is_empty() {
            GroupStatus::Complete
        } else {
            GroupStatus::Conflicted
        };

        let mut context = AggregatedContext::default();
        for task_id in &group {
            if let Some(report) = reports.get(task_id) {
                context.absorb(report);
            }
        }

        let verified_commits = self.repo.commit_count(&base, &branch).unwrap_or(0);

        let notes = if skipped.is_empty() {
            String::new()
        } else {
            format!("tasks not consolidated: {}", skipped.join(", "))
        };
        let report = GroupConsolidationReport {
            group_index,
            status,
            branch: branch.clone(),
            tasks_consolidated: consolidated.clone(),
            conflicts: conflicts.clone(),
            verified_commits,
            context: context.clone(),
            notes,
            forward_issues: context.issues.clone(),
        };

        // The report lands at the consolidation workspace root. With a
        // conflicted index it can be written but not committed.
        let report_path = workspace_path.join(GROUP_REPORT_FILE);
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&report_path, json)
            .with_context(|| format!("failed to write {}", report_path.display()))?;
        if conflicts.is_empty() {
            self.repo.commit_all(
                &workspace_path,
                &format!("claudio: group {} consolidation report", group_index + 1),
            )?;
        }

        if !session.consolidation_branches().contains(&branch) {
            session.record_consolidation_branch(&branch);
        }
        session.merge_consolidation_context(&context);

        self.bus.publish(&Event::GroupConsolidated {
            group_index,
            branch: branch.clone(),
            conflicts: conflicts.len(),
        });

        let workspace_preserved = !conflicts.is_empty();
        if !workspace_preserved {
            self.worktrees.remove_worktree(&workspace_path)?;
        }

        Ok(GroupOutcome {
            branch,
            base_branch: base,
            workspace_path,
            consolidated_tasks: consolidated,
            conflicts,
            report,
            workspace_preserved,
        })
    }

    /// Final phase: open review requests for the consolidation branches.
    ///
    /// Stacked mode opens one request per group branch, each based on the
    /// previous one; single mode opens one request based on main. Returns
    /// the request URLs in order.
    pub async fn create_review_requests(
        &self,
        session: &Session,
        requester: &dyn ReviewRequester,
    ) -> Result<Vec<String>> {
        let branches = session.consolidation_branches();
        if branches.is_empty() {
            bail!("no consolidation branches to request review for");
        }

        let main = self.repo.main_branch()?;
        let plan = session.plan().clone();
        let summary = summarize_objective(&plan.objective);

        if self.config.push_branches {
            for branch in &branches {
                self.repo
                    .push_branch(branch, true)
                    .with_context(|| format!("failed to push {branch}"))?;
            }
        }

        let mut urls = Vec::new();
        match self.config.mode {
            ConsolidationMode::Single => {
                let all_tasks: Vec<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
                let request = ReviewRequest {
                    title: format!("{WORKFLOW_TAG}: {summary}"),
                    body: request_body(&plan.objective, session, &all_tasks, &branches),
                    base_branch: main,
                    head_branch: branches[0].clone(),
                    draft: self.config.draft_requests,
                    labels: self.config.request_labels.clone(),
                };
                let url = requester
                    .create_request(&request)
                    .await
                    .with_context(|| format!("review request for {} failed", request.head_branch))?;
                session.record_review_url(&url);
                urls.push(url);
            }
            ConsolidationMode::Stacked => {
                for (i, branch) in branches.iter().enumerate() {
                    let base = if i == 0 {
                        main.clone()
                    } else {
                        branches[i - 1].clone()
                    };
                    let group_tasks: Vec<&str> = plan
                        .group(i)
                        .map(|g| g.iter().map(String::as_str).collect())
                        .unwrap_or_default();
                    let request = ReviewRequest {
                        title: format!("{WORKFLOW_TAG}: group {} - {summary}", i + 1),
                        body: request_body(&plan.objective, session, &group_tasks, &branches),
                        base_branch: base,
                        head_branch: branch.clone(),
                        draft: self.config.draft_requests,
                        labels: self.config.request_labels.clone(),
                    };
                    let url = requester.create_request(&request).await.with_context(|| {
                        format!("review request for {} failed", request.head_branch)
                    })?;
                    session.record_review_url(&url);
                    urls.push(url);
                }
            }
        }

        Ok(urls)
    }
}

/// First line of the objective, truncated for request titles.
fn summarize_objective(objective: &str) -> String {
    let first_line = objective.lines().next().unwrap_or_default().trim();
    if first_line.len() <= 60 {
        first_line.to_string()
    } else {
        let mut cut = 60;
        while !first_line.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &first_line[..cut].trim_end())
    }
}

/// Review-request body: objective, the tasks under review, and the
/// stacking order.
fn request_body(
    objective: &str,
    session: &Session,
    task_ids: &[&str],
    branches: &[String],
) -> String {
    let plan = session.plan();
    let mut body = String::new();
    body.push_str("## Objective\n\n");
    body.push_str(objective);
    body.push_str("\n\n## Tasks\n\n");
    for id in task_ids {
        let title = plan.task(id).map(|t| t.title.as_str()).unwrap_or(*id);
        body.push_str(&format!("- `{id}`: {title}\n"));
    }
    if branches.len() > 1 {
        body.push_str("\n## Stacking order\n\n");
        for (i, branch) in branches.iter().enumerate() {
            body.push_str(&format!("{}. `{branch}`\n", i + 1));
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Complexity, Plan, Task};
    use claudio_test_utils::create_temp_repo;
    use uuid::Uuid;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {id}"),
            description: String::new(),
            files: vec![],
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            priority: 0,
            complexity: Complexity::Medium,
            no_code: false,
        }
    }

    fn fixture(mode: ConsolidationMode) -> (tempfile::TempDir, Consolidator, Session) {
        let (dir, repo_path) = create_temp_repo();
        let repo = GitRepo::open(&repo_path).unwrap();
        let worktree_base = dir.path().join("consolidation-worktrees");
        let worktrees = WorktreeManager::new(repo.clone(), Some(worktree_base));
        let consolidator = Consolidator::new(
            repo,
            worktrees,
            Arc::new(EventBus::new()),
            ConsolidatorConfig {
                mode,
                policy: ConflictPolicy::Stop,
                branch_prefix: "claudio".to_string(),
                draft_requests: false,
                request_labels: vec![],
                push_branches: false,
            },
        );

        let plan = Plan::new("Add auth", vec![task("a", &[]), task("b", &["a"])]).unwrap();
        let session = Session::with_id(
            Uuid::parse_str("ab12cd34-0000-0000-0000-000000000000").unwrap(),
            Arc::new(plan),
        );
        (dir, consolidator, session)
    }

    #[test]
    fn stacked_branch_names_carry_group_suffix() {
        let (_dir, consolidator, session) = fixture(ConsolidationMode::Stacked);
        assert_eq!(
            consolidator.consolidation_branch_name(&session, 0),
            "claudio/swarm-ab12cd34-group-1"
        );
        assert_eq!(
            consolidator.consolidation_branch_name(&session, 1),
            "claudio/swarm-ab12cd34-group-2"
        );
    }

    #[test]
    fn single_mode_uses_one_branch() {
        let (_dir, consolidator, session) = fixture(ConsolidationMode::Single);
        assert_eq!(
            consolidator.consolidation_branch_name(&session, 0),
            "claudio/swarm-ab12cd34"
        );
        assert_eq!(
            consolidator.consolidation_branch_name(&session, 1),
            "claudio/swarm-ab12cd34"
        );
    }

    #[test]
    fn group_zero_bases_on_main() {
        let (_dir, consolidator, session) = fixture(ConsolidationMode::Stacked);
        assert_eq!(consolidator.base_branch_for(&session, 0).unwrap(), "main");
    }

    #[test]
    fn stacked_groups_base_on_previous_branch() {
        let (_dir, consolidator, session) = fixture(ConsolidationMode::Stacked);
        session.record_consolidation_branch("claudio/swarm-ab12cd34-group-1");
        assert_eq!(
            consolidator.base_branch_for(&session, 1).unwrap(),
            "claudio/swarm-ab12cd34-group-1"
        );
    }

    #[test]
    fn stacked_base_requires_previous_group_record() {
        let (_dir, consolidator, session) = fixture(ConsolidationMode::Stacked);
        assert!(consolidator.base_branch_for(&session, 1).is_err());
    }

    #[test]
    fn single_mode_always_bases_on_main() {
        let (_dir, consolidator, session) = fixture(ConsolidationMode::Single);
        session.record_consolidation_branch("claudio/swarm-ab12cd34");
        assert_eq!(consolidator.base_branch_for(&session, 1).unwrap(), "main");
    }

    #[test]
    fn objective_summaries_are_bounded() {
        assert_eq!(summarize_objective("Add auth"), "Add auth");
        let long = "x".repeat(200);
        let summary = summarize_objective(&long);
        assert!(summary.len() <= 63);
        assert!(summary.ends_with("..."));
        assert_eq!(summarize_objective("first line\nsecond"), "first line");
    }
}
