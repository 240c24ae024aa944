//! Review-request creation, delegated to an external host tool.
//!
//! The consolidator's contract with the tool is the [`ReviewRequest`]
//! record: title, body, base branch, head branch, draft flag, and labels.
//! Failures are reported verbatim.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

/// One review request to be opened on the hosting provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    pub title: String,
    pub body: String,
    pub base_branch: String,
    pub head_branch: String,
    pub draft: bool,
    pub labels: Vec<String>,
}

/// Seam to the hosting provider's review-request tooling.
#[async_trait]
pub trait ReviewRequester: Send + Sync {
    /// Human-readable name for this requester.
    fn name(&self) -> &str;

    /// Create the review request and return its URL.
    async fn create_request(&self, request: &ReviewRequest) -> Result<String>;
}

// Compile-time assertion: ReviewRequester must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ReviewRequester) {}
};

/// Requester backed by the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GhCliRequester {
    program: String,
}

impl GhCliRequester {
    pub fn new() -> Self {
        Self {
            program: "gh".to_string(),
        }
    }

    /// Override the executable, for tests or lookalike CLIs.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for GhCliRequester {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReviewRequester for GhCliRequester {
    fn name(&self) -> &str {
        "gh-cli"
    }

    async fn create_request(&self, request: &ReviewRequest) -> Result<String> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .arg("pr")
            .arg("create")
            .arg("--title")
            .arg(&request.title)
            .arg("--body")
            .arg(&request.body)
            .arg("--base")
            .arg(&request.base_branch)
            .arg("--head")
            .arg(&request.head_branch);
        if request.draft {
            command.arg("--draft");
        }
        for label in &request.labels {
            command.arg("--label").arg(label);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} pr create failed (exit {}): {}",
                self.program,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        // The CLI prints the request URL as its last output line.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(url)
    }
}
