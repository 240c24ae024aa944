//! Plan TOML input format.
//!
//! The front end hands plans to the core either as ready-made [`Plan`]
//! values or as a `plan.toml` document:
//!
//! ```toml
//! [plan]
//! objective = "Add authentication"
//!
//! [[tasks]]
//! id = "jwt-middleware"
//! title = "JWT middleware"
//! description = "Implement token validation middleware"
//! priority = 1
//! complexity = "medium"
//!
//! [[tasks]]
//! id = "login-endpoint"
//! title = "Login endpoint"
//! description = "POST /login issuing tokens"
//! depends_on = ["jwt-middleware"]
//! ```

use serde::Deserialize;
use thiserror::Error;

use super::{Complexity, Plan, PlanError, Task};

/// Top-level structure of a `plan.toml` document.
#[derive(Debug, Deserialize)]
pub struct PlanToml {
    pub plan: PlanMetaToml,
    #[serde(default)]
    pub tasks: Vec<TaskToml>,
}

/// The `[plan]` table.
#[derive(Debug, Deserialize)]
pub struct PlanMetaToml {
    pub objective: String,
}

/// One `[[tasks]]` entry.
#[derive(Debug, Deserialize)]
pub struct TaskToml {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub no_code: bool,
}

impl From<TaskToml> for Task {
    fn from(t: TaskToml) -> Self {
        Task {
            id: t.id,
            title: t.title,
            description: t.description,
            files: t.files,
            depends_on: t.depends_on,
            priority: t.priority,
            complexity: t.complexity,
            no_code: t.no_code,
        }
    }
}

/// Errors that can occur while loading a plan from TOML.
#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Parse and validate a `plan.toml` string into a [`Plan`].
pub fn parse_plan_toml(content: &str) -> Result<Plan, PlanParseError> {
    let doc: PlanToml = toml::from_str(content)?;
    let tasks: Vec<Task> = doc.tasks.into_iter().map(Task::from).collect();
    let plan = Plan::new(doc.plan.objective, tasks)?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_plan() {
        let toml_str = r#"
[plan]
objective = "Add authentication"

[[tasks]]
id = "jwt"
title = "JWT middleware"
description = "Token validation"
priority = 1

[[tasks]]
id = "login"
title = "Login endpoint"
description = "POST /login"
depends_on = ["jwt"]
complexity = "high"
"#;
        let plan = parse_plan_toml(toml_str).expect("should parse");
        assert_eq!(plan.objective, "Add authentication");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].complexity, Complexity::High);
        assert_eq!(
            plan.execution_order,
            vec![vec!["jwt".to_string()], vec!["login".to_string()]]
        );
    }

    #[test]
    fn rejects_missing_tasks() {
        let toml_str = r#"
[plan]
objective = "Nothing to do"
"#;
        let err = parse_plan_toml(toml_str).unwrap_err();
        assert!(matches!(err, PlanParseError::Plan(PlanError::NoTasks)));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let toml_str = r#"
[plan]
objective = "Bad dep"

[[tasks]]
id = "a"
title = "A"
description = "Task A"
depends_on = ["ghost"]
"#;
        let err = parse_plan_toml(toml_str).unwrap_err();
        assert!(matches!(
            err,
            PlanParseError::Plan(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn rejects_cycle() {
        let toml_str = r#"
[plan]
objective = "Cycle"

[[tasks]]
id = "a"
title = "A"
description = "Task A"
depends_on = ["b"]

[[tasks]]
id = "b"
title = "B"
description = "Task B"
depends_on = ["a"]
"#;
        let err = parse_plan_toml(toml_str).unwrap_err();
        assert!(matches!(
            err,
            PlanParseError::Plan(PlanError::CycleDetected(_))
        ));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = parse_plan_toml("this is not valid toml {{{").unwrap_err();
        assert!(matches!(err, PlanParseError::Toml(_)));
    }

    #[test]
    fn no_code_defaults_to_false() {
        let toml_str = r#"
[plan]
objective = "Defaults"

[[tasks]]
id = "a"
title = "A"
description = "Task A"
"#;
        let plan = parse_plan_toml(toml_str).unwrap();
        assert!(!plan.tasks[0].no_code);
        assert_eq!(plan.tasks[0].complexity, Complexity::Medium);
    }
}
