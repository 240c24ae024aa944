//! Sentinel and report file schemas.
//!
//! Worker instances signal completion by writing well-known JSON files at
//! the workspace root (or a descendant); the consolidator writes a
//! per-group report in the same family. These schemas are an external
//! interface: worker outputs vary, so decoding is deliberately tolerant.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// Per-task completion report written by a worker instance.
pub const TASK_COMPLETE_FILE: &str = ".claudio-task-complete.json";

/// Revision-round variant of the completion report.
pub const REVISION_COMPLETE_FILE: &str = ".claudio-revision-complete.json";

/// Per-group consolidation report written by the consolidator.
pub const GROUP_REPORT_FILE: &str = ".claudio-group-consolidation-complete.json";

/// Status a worker reports for its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Complete,
    Blocked,
    Failed,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A worker's completion report.
///
/// The `notes` field accepts either a string or an array of strings (joined
/// by newlines); worker outputs vary and a shape mismatch must never fail
/// the decode. The revision variant carries `revision_round` and
/// `issues_addressed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub task_id: String,
    pub status: ReportStatus,
    pub summary: String,
    pub files_modified: Vec<String>,
    #[serde(default, deserialize_with = "flexible_notes")]
    pub notes: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_round: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues_addressed: Option<Vec<String>>,
}

impl CompletionReport {
    /// Whether the worker declared the task complete.
    pub fn is_complete(&self) -> bool {
        self.status == ReportStatus::Complete
    }
}

/// Decode `notes` as a string, an array of strings joined by newlines, or
/// empty on any other shape.
fn flexible_notes<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    })
}

/// Per-group accumulation of worker context, fed into the group report and
/// forwarded to later groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedContext {
    pub notes: Vec<String>,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    /// New runtime dependencies, deduplicated in first-seen order.
    pub dependencies: Vec<String>,
}

impl AggregatedContext {
    /// Fold one completion report into the aggregate.
    pub fn absorb(&mut self, report: &CompletionReport) {
        if !report.notes.is_empty() {
            self.notes.push(report.notes.clone());
        }
        self.issues.extend(report.issues.iter().cloned());
        self.suggestions.extend(report.suggestions.iter().cloned());

        let seen: HashSet<&str> = self.dependencies.iter().map(String::as_str).collect();
        let fresh: Vec<String> = report
            .dependencies
            .iter()
            .filter(|d| !seen.contains(d.as_str()))
            .cloned()
            .collect();
        self.dependencies.extend(fresh);
    }

    /// Merge another aggregate into this one (dependencies stay deduped).
    pub fn merge(&mut self, other: &AggregatedContext) {
        self.notes.extend(other.notes.iter().cloned());
        self.issues.extend(other.issues.iter().cloned());
        self.suggestions.extend(other.suggestions.iter().cloned());
        let seen: HashSet<&str> = self.dependencies.iter().map(String::as_str).collect();
        let fresh: Vec<String> = other
            .dependencies
            .iter()
            .filter(|d| !seen.contains(d.as_str()))
            .cloned()
            .collect();
        self.dependencies.extend(fresh);
    }
}

/// Structured description of a cherry-pick conflict, surfaced for human
/// resolution instead of raw subprocess output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDescriptor {
    pub task_id: String,
    pub task_title: String,
    pub branch: String,
    pub commit: String,
    pub files: Vec<String>,
    /// Working copy preserved for inspection.
    pub workspace: PathBuf,
}

/// Outcome status of a group consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Complete,
    Conflicted,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::Conflicted => "conflicted",
        };
        f.write_str(s)
    }
}

/// The per-group consolidation report, written as
/// [`GROUP_REPORT_FILE`] at the consolidation workspace root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConsolidationReport {
    pub group_index: usize,
    pub status: GroupStatus,
    pub branch: String,
    pub tasks_consolidated: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<ConflictDescriptor>,
    /// Commits verified on the consolidation branch relative to its base.
    pub verified_commits: u32,
    #[serde(default)]
    pub context: AggregatedContext,
    #[serde(default)]
    pub notes: String,
    /// Issues to forward to the next group.
    #[serde(default)]
    pub forward_issues: Vec<String>,
}
