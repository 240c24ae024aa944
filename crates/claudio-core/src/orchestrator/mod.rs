//! Session orchestrator: runs a plan to completion by driving worker
//! instances over the task queue, verifying their work, consolidating
//! each finished group, and opening review requests at the end.
//!
//! Each worker instance is a task loop: claim, create workspace, run the
//! agent, verify, settle. The main loop sweeps stale claims, waits for
//! the current group to reach a terminal state, surfaces partial failure
//! as a signal, consolidates, and advances the group gate.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use claudio_git::{GitRepo, WorktreeManager};

use crate::agent::AgentRunner;
use crate::config::{CoreConfig, WORKFLOW_TAG};
use crate::consolidate::{Consolidator, ConsolidatorConfig, GroupOutcome, ReviewRequester};
use crate::coordinator::{Coordinator, CoordinatorConfig, QueueOps};
use crate::events::{Event, EventBus};
use crate::plan::{Plan, Task};
use crate::queue::{QueueError, ReleaseReason, TaskQueue};
use crate::report::{CompletionReport, ConflictDescriptor};
use crate::scheduler;
use crate::session::{Session, WorkspaceDescriptor};
use crate::slug::slug;
use crate::verify::{Verifier, VerifyConfig, VerifyOutcome};

/// Poll interval of the group-completion wait loop.
const WAIT_TICK: Duration = Duration::from_millis(50);

/// How long workers get to drain after cancellation.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Everything a session run needs, wired together.
pub struct RunContext {
    pub session: Arc<Session>,
    pub queue: Arc<TaskQueue>,
    pub bus: Arc<EventBus>,
    pub coordinator: Arc<Coordinator>,
    pub verifier: Arc<Verifier>,
    pub consolidator: Arc<Consolidator>,
    pub agent: Arc<dyn AgentRunner>,
    pub worktrees: WorktreeManager,
    pub requester: Option<Arc<dyn ReviewRequester>>,
    pub config: CoreConfig,
}

impl RunContext {
    /// Wire up a full run context over one repository.
    pub fn new(
        repo: GitRepo,
        worktree_base: Option<PathBuf>,
        plan: Arc<Plan>,
        agent: Arc<dyn AgentRunner>,
        requester: Option<Arc<dyn ReviewRequester>>,
        config: CoreConfig,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(TaskQueue::new(Arc::clone(&bus)));
        let session = Arc::new(Session::new(plan));
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&queue) as Arc<dyn QueueOps>,
            Arc::clone(&bus),
            CoordinatorConfig {
                max_tasks_per_instance: config.max_tasks_per_instance,
                rebalance_interval: config.rebalance_interval,
            },
        ));
        let verifier = Arc::new(Verifier::new(
            repo.clone(),
            Arc::clone(&bus),
            VerifyConfig::from(&config),
        ));
        let worktrees = WorktreeManager::new(repo.clone(), worktree_base);
        let consolidator = Arc::new(Consolidator::new(
            repo,
            worktrees.clone(),
            Arc::clone(&bus),
            ConsolidatorConfig::from(&config),
        ));

        Self {
            session,
            queue,
            bus,
            coordinator,
            verifier,
            consolidator,
            agent,
            worktrees,
            requester,
            config,
        }
    }
}

/// Terminal outcome of a session run.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionResult {
    /// Every task completed and, where configured, review requests were
    /// opened.
    Completed { review_urls: Vec<String> },
    /// The plan ran to the end but some tasks failed or some groups
    /// mixed successes and failures.
    CompletedWithFailures {
        failed_tasks: Vec<String>,
        partial_groups: Vec<usize>,
        review_urls: Vec<String>,
    },
    /// Consolidation hit a merge conflict; the group's working copy is
    /// preserved and later groups were not attempted.
    Conflicted {
        group_index: usize,
        conflicts: Vec<ConflictDescriptor>,
    },
    /// The run was cancelled.
    Interrupted,
}

/// Branch name for one task's workspace:
/// `<prefix>/<tag>-<short-session>/<task-slug>`.
fn task_branch_name(prefix: &str, short_session: &str, task_id: &str) -> String {
    format!("{prefix}/{WORKFLOW_TAG}-{short_session}/{}", slug(task_id))
}

/// State shared by every worker instance loop.
#[derive(Clone)]
struct InstanceShared {
    session: Arc<Session>,
    queue: Arc<TaskQueue>,
    verifier: Arc<Verifier>,
    agent: Arc<dyn AgentRunner>,
    worktrees: WorktreeManager,
    main_branch: String,
    branch_prefix: String,
    reports: Arc<Mutex<HashMap<String, CompletionReport>>>,
}

/// Run the session to a terminal result.
pub async fn run_session(ctx: RunContext, cancel: CancellationToken) -> Result<SessionResult> {
    let plan = ctx.session.plan().clone();
    let main_branch = ctx
        .worktrees
        .repo()
        .main_branch()
        .context("cannot discover the repository's main branch")?;

    tracing::info!(
        session = %ctx.session.short_id(),
        tasks = plan.tasks.len(),
        groups = plan.group_count(),
        "starting session"
    );

    for task in &plan.tasks {
        ctx.queue.enqueue(task.clone())?;
    }
    set_group_gate(&ctx, 0);

    ctx.coordinator.start();

    let reports: Arc<Mutex<HashMap<String, CompletionReport>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let shared = InstanceShared {
        session: Arc::clone(&ctx.session),
        queue: Arc::clone(&ctx.queue),
        verifier: Arc::clone(&ctx.verifier),
        agent: Arc::clone(&ctx.agent),
        worktrees: ctx.worktrees.clone(),
        main_branch,
        branch_prefix: ctx.config.branch_prefix.clone(),
        reports: Arc::clone(&reports),
    };

    let workers_cancel = cancel.child_token();
    let mut handles = Vec::new();
    for i in 0..ctx.config.max_instances.max(1) {
        let instance_id = format!("instance-{}", i + 1);
        handles.push(tokio::spawn(run_instance(
            instance_id,
            shared.clone(),
            workers_cancel.clone(),
        )));
    }

    let mut partial_groups: Vec<usize> = Vec::new();
    let mut conflict_stop: Option<GroupOutcome> = None;
    let mut interrupted = false;

    'groups: for group_index in 0..plan.group_count() {
        // Wait for every task in the group to reach a terminal outcome.
        loop {
            if cancel.is_cancelled() {
                interrupted = true;
                break 'groups;
            }
            ctx.queue
                .release_stale_claims(ctx.config.stale_claim_timeout);
            fail_dependency_blocked_tasks(&ctx, group_index);
            if scheduler::is_current_group_complete(&ctx.session) {
                break;
            }
            tokio::time::sleep(WAIT_TICK).await;
        }

        if scheduler::has_partial_failure(&ctx.session, group_index) {
            tracing::warn!(group = group_index, "group finished with partial failure");
            partial_groups.push(group_index);
            ctx.bus.publish(&Event::GroupPartialFailure { group_index });
        }

        // Consolidate whatever the group completed.
        let any_completed = plan
            .group(group_index)
            .map(|group| group.iter().any(|id| ctx.session.is_completed(id)))
            .unwrap_or(false);
        if any_completed {
            let snapshot = reports.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let outcome = ctx
                .consolidator
                .consolidate_group(&ctx.session, group_index, &snapshot, &cancel)
                .with_context(|| format!("consolidation of group {group_index} failed"))?;
            if outcome.has_conflicts() {
                // Conflicts stop the plan; later groups are not attempted.
                conflict_stop = Some(outcome);
                break 'groups;
            }
            // Consolidated work lives on the task branches now; the
            // worktrees can go. Failed tasks keep theirs for inspection.
            cleanup_group_workspaces(&ctx, &outcome.consolidated_tasks);
        }

        if scheduler::advance_group_if_complete(&ctx.session) {
            let next = ctx.session.current_group();
            ctx.bus.publish(&Event::GroupAdvanced { group_index: next });
            set_group_gate(&ctx, next);
        }
    }

    // Shut down workers on every exit path, draining in-flight work.
    workers_cancel.cancel();
    for handle in handles {
        if tokio::time::timeout(DRAIN_DEADLINE, handle).await.is_err() {
            tracing::warn!("worker did not exit within the drain deadline");
        }
    }
    ctx.coordinator.stop().await;

    if interrupted {
        tracing::info!("session interrupted");
        return Ok(SessionResult::Interrupted);
    }

    if let Some(outcome) = conflict_stop {
        return Ok(SessionResult::Conflicted {
            group_index: outcome.report.group_index,
            conflicts: outcome.conflicts,
        });
    }

    // Final phase: review requests over the consolidated branches.
    let mut review_urls = Vec::new();
    if !ctx.config.dry_run && !ctx.config.skip_synthesis {
        if let Some(requester) = &ctx.requester {
            if !ctx.session.consolidation_branches().is_empty() {
                review_urls = ctx
                    .consolidator
                    .create_review_requests(&ctx.session, requester.as_ref())
                    .await?;
            }
        }
    }

    let mut failed_tasks: Vec<String> = ctx.session.failed_tasks().into_iter().collect();
    failed_tasks.sort_unstable();

    if failed_tasks.is_empty() && partial_groups.is_empty() {
        Ok(SessionResult::Completed { review_urls })
    } else {
        Ok(SessionResult::CompletedWithFailures {
            failed_tasks,
            partial_groups,
            review_urls,
        })
    }
}

/// Remove the worktrees of consolidated tasks and prune stale entries.
fn cleanup_group_workspaces(ctx: &RunContext, task_ids: &[String]) {
    for task_id in task_ids {
        if let Some(workspace) = ctx.session.workspace(task_id) {
            if let Err(e) = ctx.worktrees.remove_worktree(&workspace.path) {
                tracing::warn!(task_id = %task_id, error = %e, "failed to remove task workspace");
            }
        }
    }
    if let Err(e) = ctx.worktrees.cleanup_stale() {
        tracing::warn!(error = %e, "worktree prune failed");
    }
}

/// A task whose dependency failed permanently can never become ready;
/// without this sweep its group would never reach a terminal state.
fn fail_dependency_blocked_tasks(ctx: &RunContext, group_index: usize) {
    let plan = ctx.session.plan().clone();
    let Some(group) = plan.group(group_index) else {
        return;
    };
    let failed = ctx.session.failed_tasks();
    if failed.is_empty() {
        return;
    }
    for task_id in group {
        if ctx.session.is_terminal(task_id) || ctx.session.assignment(task_id).is_some() {
            continue;
        }
        if plan
            .dependencies(task_id)
            .iter()
            .any(|dep| failed.contains(dep))
        {
            tracing::warn!(task_id = %task_id, "dependency failed permanently, task cannot run");
            ctx.session.mark_failed(task_id);
        }
    }
}

fn set_group_gate(ctx: &RunContext, group_index: usize) {
    let gate = ctx
        .session
        .plan()
        .group(group_index)
        .map(|group| group.iter().cloned().collect::<HashSet<String>>());
    ctx.queue.set_group_gate(gate);
}

/// One worker instance: claim, process, repeat until cancelled.
async fn run_instance(instance_id: String, shared: InstanceShared, cancel: CancellationToken) {
    tracing::info!(instance_id = %instance_id, agent = shared.agent.name(), "worker started");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let claimed = match shared.queue.claim_next(&instance_id) {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::warn!(instance_id = %instance_id, error = %e, "claim failed");
                None
            }
        };

        let Some(task) = claimed else {
            tokio::select! {
                _ = tokio::time::sleep(WAIT_TICK) => {}
                _ = cancel.cancelled() => break,
            }
            continue;
        };

        if let Err(e) = process_task(&instance_id, &shared, &task, &cancel).await {
            tracing::error!(
                instance_id = %instance_id,
                task_id = %task.id,
                error = %e,
                "task processing failed, returning claim to the queue"
            );
            shared.session.unassign(&task.id);
            if let Err(release_err) = shared
                .queue
                .release(&task.id, ReleaseReason::Other("worker_error".into()))
            {
                if !matches!(release_err, QueueError::InvalidTransition { .. }) {
                    tracing::warn!(task_id = %task.id, error = %release_err, "release failed");
                }
            }
        }
    }
    tracing::info!(instance_id = %instance_id, "worker stopped");
}

/// Process one claimed task through workspace creation, the agent run,
/// and verification.
async fn process_task(
    instance_id: &str,
    shared: &InstanceShared,
    task: &Task,
    cancel: &CancellationToken,
) -> Result<()> {
    shared.session.assign(&task.id, instance_id);

    let branch = task_branch_name(
        &shared.branch_prefix,
        &shared.session.short_id(),
        &task.id,
    );
    let info = shared
        .worktrees
        .create_worktree(&branch, Some(&shared.main_branch))
        .with_context(|| format!("failed to create workspace for task {}", task.id))?;
    let workspace = WorkspaceDescriptor {
        path: info.path,
        branch,
        base_branch: shared.main_branch.clone(),
    };
    shared.session.add_workspace(&task.id, workspace.clone());

    shared.queue.mark_running(&task.id)?;

    if let Err(e) = shared.agent.run_task(task, &workspace, cancel).await {
        // The agent may have done useful work before failing; the
        // verifier inspects the workspace either way.
        tracing::warn!(task_id = %task.id, error = %e, "agent run failed");
    }

    match shared.verifier.verify_task(task, &workspace) {
        VerifyOutcome::Success {
            commit_count,
            report,
        } => {
            tracing::info!(
                task_id = %task.id,
                commits = commit_count,
                "task verified"
            );
            shared
                .session
                .record_verified_commits(&task.id, commit_count);
            if let Some(report) = report {
                shared
                    .reports
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(task.id.clone(), report);
            }
            shared.session.mark_completed(&task.id);
            shared.queue.complete(&task.id, true)?;
        }
        VerifyOutcome::NeedsRetry {
            attempt,
            max_retries,
        } => {
            tracing::info!(
                task_id = %task.id,
                attempt = attempt,
                max_retries = max_retries,
                "task produced no work, requeueing"
            );
            shared.session.unassign(&task.id);
            shared.queue.release(&task.id, ReleaseReason::NoCommits)?;
        }
        VerifyOutcome::Failed { attempts, reason } => {
            tracing::warn!(
                task_id = %task.id,
                attempts = attempts,
                reason = %reason,
                "task failed permanently"
            );
            shared.session.record_verified_commits(&task.id, 0);
            shared.session.mark_failed(&task.id);
            shared.queue.complete(&task.id, false)?;
        }
    }

    Ok(())
}
