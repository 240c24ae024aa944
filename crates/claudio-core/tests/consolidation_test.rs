//! Consolidation-engine integration tests against real git repositories.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use claudio_core::config::ConsolidationMode;
use claudio_core::consolidate::{ConflictPolicy, Consolidator, ConsolidatorConfig};
use claudio_core::events::EventBus;
use claudio_core::plan::{Complexity, Plan, Task};
use claudio_core::report::{CompletionReport, GROUP_REPORT_FILE, GroupStatus, ReportStatus};
use claudio_core::session::{Session, WorkspaceDescriptor};
use claudio_git::{GitRepo, WorktreeManager};
use claudio_test_utils::{commit_file, create_temp_repo, git_ok, init_test_logging};

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

struct Fixture {
    _dir: tempfile::TempDir,
    repo_path: std::path::PathBuf,
    repo: GitRepo,
    consolidator: Consolidator,
    session: Session,
}

impl Fixture {
    fn new(plan: Plan, mode: ConsolidationMode, policy: ConflictPolicy) -> Self {
        let (dir, repo_path) = create_temp_repo();
        let repo = GitRepo::open(&repo_path).unwrap();
        let worktrees =
            WorktreeManager::new(repo.clone(), Some(dir.path().join("aux-worktrees")));
        let consolidator = Consolidator::new(
            repo.clone(),
            worktrees,
            Arc::new(EventBus::new()),
            ConsolidatorConfig {
                mode,
                policy,
                branch_prefix: "claudio".to_string(),
                draft_requests: false,
                request_labels: vec![],
                push_branches: false,
            },
        );
        let session = Session::new(Arc::new(plan));
        Self {
            _dir: dir,
            repo_path,
            repo,
            consolidator,
            session,
        }
    }

    /// Create a task branch off main with the given file contents, commit
    /// them, and record the task as completed in the session.
    fn complete_task_with_commits(&self, task_id: &str, files: &[(&str, &str)]) {
        let branch = format!("claudio/task/{task_id}");
        git_ok(&self.repo_path, &["checkout", "-b", &branch, "main"]);
        for (path, content) in files {
            commit_file(
                &self.repo_path,
                path,
                content,
                &format!("claudio: {task_id} changes {path}"),
            );
        }
        git_ok(&self.repo_path, &["checkout", "main"]);

        self.session.add_workspace(
            task_id,
            WorkspaceDescriptor {
                path: self.repo_path.clone(),
                branch,
                base_branch: "main".to_string(),
            },
        );
        self.session.mark_completed(task_id);
        self.session.record_verified_commits(task_id, files.len() as u32);
    }
}

#[test]
fn stacked_groups_chain_their_bases() {
    init_test_logging();
    let plan = Plan::new(
        "Stacked",
        vec![task("t1", &[], 0), task("t2", &[], 1), task("t3", &["t1", "t2"], 0)],
    )
    .unwrap();
    let fixture = Fixture::new(plan, ConsolidationMode::Stacked, ConflictPolicy::Stop);

    fixture.complete_task_with_commits("t1", &[("t1.txt", "one\n")]);
    fixture.complete_task_with_commits("t2", &[("t2.txt", "two\n")]);

    let reports = HashMap::new();
    let cancel = CancellationToken::new();
    let outcome0 = fixture
        .consolidator
        .consolidate_group(&fixture.session, 0, &reports, &cancel)
        .unwrap();

    assert_eq!(outcome0.base_branch, "main");
    assert!(!outcome0.has_conflicts());
    assert_eq!(outcome0.consolidated_tasks, vec!["t1", "t2"]);
    assert!(fixture.repo.branch_exists(&outcome0.branch).unwrap());

    fixture.session.advance_group();
    fixture.complete_task_with_commits("t3", &[("t3.txt", "three\n")]);

    let outcome1 = fixture
        .consolidator
        .consolidate_group(&fixture.session, 1, &reports, &cancel)
        .unwrap();

    // Group n's base is group n-1's consolidation branch.
    assert_eq!(outcome1.base_branch, outcome0.branch);
    let files = fixture
        .repo
        .changed_files(&outcome0.branch, &outcome1.branch)
        .unwrap();
    assert!(files.contains(&"t3.txt".to_string()));
    assert!(!files.contains(&"t1.txt".to_string()));

    assert_eq!(
        fixture.session.consolidation_branches(),
        vec![outcome0.branch.clone(), outcome1.branch.clone()]
    );
}

#[test]
fn conflict_stops_the_group_and_preserves_the_workspace() {
    init_test_logging();
    let plan = Plan::new("Conflicting", vec![task("t1", &[], 0), task("t2", &[], 1)]).unwrap();
    let fixture = Fixture::new(plan, ConsolidationMode::Stacked, ConflictPolicy::Stop);

    // Both tasks rewrite the same line of the same file.
    fixture.complete_task_with_commits("t1", &[("shared.txt", "from t1\n")]);
    fixture.complete_task_with_commits("t2", &[("shared.txt", "from t2\n")]);

    let outcome = fixture
        .consolidator
        .consolidate_group(&fixture.session, 0, &HashMap::new(), &CancellationToken::new())
        .unwrap();

    assert_eq!(outcome.report.status, GroupStatus::Conflicted);
    assert_eq!(outcome.consolidated_tasks, vec!["t1"]);
    assert_eq!(outcome.conflicts.len(), 1);

    let conflict = &outcome.conflicts[0];
    assert_eq!(conflict.task_id, "t2");
    assert_eq!(conflict.task_title, "Task t2");
    assert_eq!(conflict.files, vec!["shared.txt"]);

    // The auxiliary working copy survives for human inspection, holding
    // the conflicted state and the (uncommitted) group report.
    assert!(outcome.workspace_preserved);
    assert!(outcome.workspace_path.exists());
    assert!(outcome.workspace_path.join(GROUP_REPORT_FILE).exists());
    assert!(
        !fixture
            .repo
            .conflicted_files(&outcome.workspace_path)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn skip_policy_aborts_and_reports_the_conflicted_task() {
    init_test_logging();
    let plan = Plan::new(
        "Skip policy",
        vec![task("t1", &[], 0), task("t2", &[], 1), task("t3", &[], 2)],
    )
    .unwrap();
    let fixture = Fixture::new(plan, ConsolidationMode::Stacked, ConflictPolicy::Skip);

    fixture.complete_task_with_commits("t1", &[("shared.txt", "from t1\n")]);
    fixture.complete_task_with_commits("t2", &[("shared.txt", "from t2\n")]);
    fixture.complete_task_with_commits("t3", &[("t3.txt", "three\n")]);

    let outcome = fixture
        .consolidator
        .consolidate_group(&fixture.session, 0, &HashMap::new(), &CancellationToken::new())
        .unwrap();

    // t2 conflicted and was skipped; t3 still landed.
    assert_eq!(outcome.consolidated_tasks, vec!["t1", "t3"]);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].task_id, "t2");
    assert!(outcome.report.notes.contains("t2"));
}

#[test]
fn aggregated_context_lands_in_the_group_report() {
    init_test_logging();
    let plan = Plan::new("Context", vec![task("t1", &[], 0), task("t2", &[], 1)]).unwrap();
    let fixture = Fixture::new(plan, ConsolidationMode::Stacked, ConflictPolicy::Stop);

    fixture.complete_task_with_commits("t1", &[("t1.txt", "one\n")]);
    fixture.complete_task_with_commits("t2", &[("t2.txt", "two\n")]);

    let mut reports = HashMap::new();
    reports.insert(
        "t1".to_string(),
        CompletionReport {
            task_id: "t1".into(),
            status: ReportStatus::Complete,
            summary: "done".into(),
            files_modified: vec!["t1.txt".into()],
            notes: "added the helper".into(),
            issues: vec!["needs docs".into()],
            suggestions: vec![],
            dependencies: vec!["serde".into()],
            revision_round: None,
            issues_addressed: None,
        },
    );
    reports.insert(
        "t2".to_string(),
        CompletionReport {
            task_id: "t2".into(),
            status: ReportStatus::Complete,
            summary: "done".into(),
            files_modified: vec!["t2.txt".into()],
            notes: String::new(),
            issues: vec![],
            suggestions: vec!["unify error types".into()],
            dependencies: vec!["serde".into(), "tokio".into()],
            revision_round: None,
            issues_addressed: None,
        },
    );

    let outcome = fixture
        .consolidator
        .consolidate_group(&fixture.session, 0, &reports, &CancellationToken::new())
        .unwrap();

    let context = &outcome.report.context;
    assert_eq!(context.notes, vec!["added the helper"]);
    assert_eq!(context.issues, vec!["needs docs"]);
    assert_eq!(context.suggestions, vec!["unify error types"]);
    // Dependencies deduplicate across task reports.
    assert_eq!(context.dependencies, vec!["serde", "tokio"]);
    assert_eq!(outcome.report.forward_issues, vec!["needs docs"]);

    // The report was committed onto the consolidation branch.
    let files = fixture.repo.changed_files("main", &outcome.branch).unwrap();
    assert!(files.contains(&GROUP_REPORT_FILE.to_string()));
}

#[test]
fn single_mode_accumulates_groups_on_one_branch() {
    init_test_logging();
    let plan = Plan::new(
        "Single branch",
        vec![task("t1", &[], 0), task("t2", &["t1"], 0)],
    )
    .unwrap();
    let fixture = Fixture::new(plan, ConsolidationMode::Single, ConflictPolicy::Stop);

    fixture.complete_task_with_commits("t1", &[("t1.txt", "one\n")]);
    let outcome0 = fixture
        .consolidator
        .consolidate_group(&fixture.session, 0, &HashMap::new(), &CancellationToken::new())
        .unwrap();

    fixture.session.advance_group();
    fixture.complete_task_with_commits("t2", &[("t2.txt", "two\n")]);
    let outcome1 = fixture
        .consolidator
        .consolidate_group(&fixture.session, 1, &HashMap::new(), &CancellationToken::new())
        .unwrap();

    // One branch, always based on main, carrying both groups' work.
    assert_eq!(outcome0.branch, outcome1.branch);
    assert_eq!(outcome1.base_branch, "main");
    assert_eq!(fixture.session.consolidation_branches().len(), 1);

    let files = fixture.repo.changed_files("main", &outcome1.branch).unwrap();
    assert!(files.contains(&"t1.txt".to_string()));
    assert!(files.contains(&"t2.txt".to_string()));
}

#[test]
fn cancellation_removes_the_workspace_when_clean() {
    init_test_logging();
    let plan = Plan::new("Cancelled", vec![task("t1", &[], 0)]).unwrap();
    let fixture = Fixture::new(plan, ConsolidationMode::Stacked, ConflictPolicy::Stop);
    fixture.complete_task_with_commits("t1", &[("t1.txt", "one\n")]);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fixture
        .consolidator
        .consolidate_group(&fixture.session, 0, &HashMap::new(), &cancel)
        .unwrap_err();
    assert!(err.to_string().contains("cancelled"));

    // No auxiliary working copy is left behind.
    let leftover = fixture
        .consolidator
        .consolidation_branch_name(&fixture.session, 0);
    let dir_name = WorktreeManager::dir_name_for_branch(&leftover);
    assert!(!fixture._dir.path().join("aux-worktrees").join(dir_name).exists());
}
