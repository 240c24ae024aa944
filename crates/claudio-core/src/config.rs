//! Core configuration.
//!
//! The surrounding front end owns configuration loading; the core accepts a
//! fully-resolved [`CoreConfig`] object.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed identifier for this workflow, used as the middle segment of
/// branch names (`<prefix>/<tag>-<session>`).
pub const WORKFLOW_TAG: &str = "swarm";

/// How consolidated group branches relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationMode {
    /// One branch per group, each based on the previous group's branch;
    /// one review request per branch, stacked.
    Stacked,
    /// One branch from main containing every group's work; one review
    /// request.
    Single,
}

impl fmt::Display for ConsolidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stacked => "stacked",
            Self::Single => "single",
        };
        f.write_str(s)
    }
}

impl FromStr for ConsolidationMode {
    type Err = ConsolidationModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stacked" => Ok(Self::Stacked),
            "single" => Ok(Self::Single),
            other => Err(ConsolidationModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ConsolidationMode`] string.
#[derive(Debug, Clone)]
pub struct ConsolidationModeParseError(pub String);

impl fmt::Display for ConsolidationModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid consolidation mode: {:?}", self.0)
    }
}

impl std::error::Error for ConsolidationModeParseError {}

/// Resolved configuration for a session run.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum number of parallel worker instances.
    pub max_instances: usize,
    /// Skip all repository mutations and review requests.
    pub dry_run: bool,
    /// Skip the final review-request phase.
    pub skip_synthesis: bool,
    /// Consolidation strategy.
    pub consolidation_mode: ConsolidationMode,
    /// Create review requests as drafts.
    pub draft_requests: bool,
    /// Labels attached to review requests.
    pub request_labels: Vec<String>,
    /// Leading branch segment, typically the organisation name.
    pub branch_prefix: String,
    /// Retry budget for tasks that finish without verified commits.
    pub max_task_retries: u32,
    /// Require a commit (or a completion report) before treating a task
    /// as done.
    pub require_verified_commits: bool,
    /// Claims older than this without progress are released back to the
    /// queue.
    pub stale_claim_timeout: Duration,
    /// Interval of the coordinator's rebalance loop; zero disables it.
    pub rebalance_interval: Duration,
    /// Workload an instance can carry before a scale-up is recommended.
    pub max_tasks_per_instance: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_instances: 3,
            dry_run: false,
            skip_synthesis: false,
            consolidation_mode: ConsolidationMode::Stacked,
            draft_requests: false,
            request_labels: Vec::new(),
            branch_prefix: "claudio".to_string(),
            max_task_retries: 3,
            require_verified_commits: true,
            stale_claim_timeout: Duration::from_secs(10 * 60),
            rebalance_interval: Duration::from_secs(30),
            max_tasks_per_instance: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_strings() {
        for mode in [ConsolidationMode::Stacked, ConsolidationMode::Single] {
            let s = mode.to_string();
            assert_eq!(s.parse::<ConsolidationMode>().unwrap(), mode);
        }
        assert!("both".parse::<ConsolidationMode>().is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let config = CoreConfig::default();
        assert_eq!(config.max_task_retries, 3);
        assert!(config.require_verified_commits);
        assert!(!config.rebalance_interval.is_zero());
    }
}
