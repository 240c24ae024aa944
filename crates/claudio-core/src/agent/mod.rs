//! The `AgentRunner` trait -- the seam to the external code-writing
//! process.
//!
//! The agent itself (the process that authors code, its prompts, and its
//! I/O) is an external collaborator. The core only needs to start a task
//! in a workspace and wait for it to finish; everything the agent did is
//! read back from the filesystem by the verifier.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::plan::Task;
use crate::session::WorkspaceDescriptor;

/// Adapter interface for driving one external agent run.
///
/// Implementors wrap a specific agent CLI and block until the agent exits
/// (or the token is cancelled). The trait is object-safe so runners can be
/// stored as `Arc<dyn AgentRunner>`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Human-readable name for this runner.
    fn name(&self) -> &str;

    /// Run the agent for `task` inside `workspace` until completion.
    ///
    /// The run's observable output is whatever the agent left in the
    /// workspace: commits on the task branch and, optionally, a
    /// completion report. An error here does not fail the task by itself;
    /// the verifier still inspects the workspace.
    async fn run_task(
        &self,
        task: &Task,
        workspace: &WorkspaceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

// Compile-time assertion: AgentRunner must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentRunner) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Complexity;
    use std::path::PathBuf;

    /// A runner that does nothing, proving the trait is implementable and
    /// usable as `dyn AgentRunner`.
    struct NoopRunner;

    #[async_trait]
    impl AgentRunner for NoopRunner {
        fn name(&self) -> &str {
            "noop"
        }

        async fn run_task(
            &self,
            _task: &Task,
            _workspace: &WorkspaceDescriptor,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn noop_runner_is_object_safe() {
        let runner: Box<dyn AgentRunner> = Box::new(NoopRunner);
        assert_eq!(runner.name(), "noop");

        let task = Task {
            id: "t1".into(),
            title: "Test".into(),
            description: "A test task.".into(),
            files: vec![],
            depends_on: vec![],
            priority: 0,
            complexity: Complexity::Low,
            no_code: true,
        };
        let workspace = WorkspaceDescriptor {
            path: PathBuf::from("/tmp"),
            branch: "branch".into(),
            base_branch: "main".into(),
        };
        runner
            .run_task(&task, &workspace, &CancellationToken::new())
            .await
            .unwrap();
    }
}
