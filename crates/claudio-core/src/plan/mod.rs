//! Plan model: tasks, dependency graph, and the precomputed execution
//! order.
//!
//! A plan is immutable after creation. Validation enforces unique task IDs,
//! known dependency references, and an acyclic graph; the execution order is
//! a topological layering where each group holds tasks with no mutual
//! dependencies, ordered within the group by priority.

pub mod toml_format;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Complexity hint attached to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for Complexity {
    type Err = ComplexityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(ComplexityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Complexity`] string.
#[derive(Debug, Clone)]
pub struct ComplexityParseError(pub String);

impl fmt::Display for ComplexityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid complexity: {:?}", self.0)
    }
}

impl std::error::Error for ComplexityParseError {}

/// A unit of work assignable to one worker instance. Immutable after plan
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within a plan.
    pub id: String,
    pub title: String,
    pub description: String,
    /// Files the task is expected to touch. A hint only.
    #[serde(default)]
    pub files: Vec<String>,
    /// Direct predecessor task IDs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Smaller runs earlier within ties.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub complexity: Complexity,
    /// Verification-only tasks succeed without commits.
    #[serde(default)]
    pub no_code: bool,
}

/// Errors that can occur during plan validation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan must contain at least one task")]
    NoTasks,

    #[error("duplicate task id: {0:?}")]
    DuplicateTaskId(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),
}

/// Immutable plan: tasks, dependency map, and precomputed execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    /// The user objective the tasks decompose.
    pub objective: String,
    pub tasks: Vec<Task>,
    /// Groups of task IDs in dependency-respecting layered order. Every
    /// task appears in exactly one group; tasks within a group may run
    /// concurrently.
    pub execution_order: Vec<Vec<String>>,
}

impl Plan {
    /// Validate tasks and compute the execution order.
    pub fn new(objective: impl Into<String>, tasks: Vec<Task>) -> Result<Self, PlanError> {
        if tasks.is_empty() {
            return Err(PlanError::NoTasks);
        }

        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateTaskId(task.id.clone()));
            }
        }

        for task in &tasks {
            for dep in &task.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let execution_order = layer_tasks(&tasks)?;

        Ok(Self {
            id: Uuid::new_v4(),
            objective: objective.into(),
            tasks,
            execution_order,
        })
    }

    /// Look up a task by ID.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Direct dependencies of a task. Empty for unknown IDs.
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.task(id).map(|t| t.depends_on.as_slice()).unwrap_or(&[])
    }

    /// The task IDs of a group, in their in-group execution order.
    pub fn group(&self, index: usize) -> Option<&[String]> {
        self.execution_order.get(index).map(|g| g.as_slice())
    }

    /// Number of execution groups.
    pub fn group_count(&self) -> usize {
        self.execution_order.len()
    }
}

/// Topological layering via Kahn's algorithm by levels.
///
/// Each group collects the tasks whose remaining in-degree is zero; within
/// a group tasks are ordered by `(priority, id)`. A non-empty remainder
/// after layering means a cycle.
fn layer_tasks(tasks: &[Task]) -> Result<Vec<Vec<String>>, PlanError> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut in_degree: HashMap<&str, usize> =
        tasks.iter().map(|t| (t.id.as_str(), t.depends_on.len())).collect();

    // Reverse adjacency: dependency -> dependents.
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
    }

    let mut current: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut placed = 0usize;

    while !current.is_empty() {
        current.sort_by_key(|id| (by_id[id].priority, *id));

        let mut next: Vec<&str> = Vec::new();
        for id in &current {
            if let Some(children) = dependents.get(id) {
                for child in children {
                    let deg = in_degree.get_mut(child).expect("child registered");
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(child);
                    }
                }
            }
        }

        placed += current.len();
        groups.push(current.iter().map(|id| id.to_string()).collect());
        current = next;
    }

    if placed != tasks.len() {
        let mut cycle: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(id, _)| *id)
            .collect();
        cycle.sort_unstable();
        return Err(PlanError::CycleDetected(cycle.join(", ")));
    }

    Ok(groups)
}
