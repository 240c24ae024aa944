//! Authoritative task-lifecycle state machine.
//!
//! The queue owns every task's state and enforces the transition graph:
//!
//! ```text
//! pending  -> claimed
//! claimed  -> running
//! running  -> completed
//! running  -> failed
//! claimed  -> released     (stale claim, reassignment, retry)
//! running  -> released
//! released -> claimed      (re-entry, retry count incremented at release)
//! ```
//!
//! Every successful mutation publishes a typed event to the bus. Invalid
//! transitions fail with [`QueueError::InvalidTransition`] and publish
//! nothing. Events are published after the queue lock is dropped so that
//! handlers can call back into the queue.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{Event, EventBus};
use crate::plan::Task;

/// Status of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Released,
    /// Released by the coordinator specifically to move load between
    /// instances; claimable like `released`.
    Reassigning,
}

impl TaskState {
    /// Whether a task in this state can be handed to [`TaskQueue::claim_next`].
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Released | Self::Reassigning)
    }

    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Released => "released",
            Self::Reassigning => "reassigning",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "released" => Ok(Self::Released),
            "reassigning" => Ok(Self::Reassigning),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

/// Why a claim was released back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The claim exceeded the stale-claim timeout without progress.
    StaleClaim,
    /// The coordinator is moving load between instances.
    Reassignment,
    /// The verifier found no commits and granted a retry.
    NoCommits,
    /// The owning instance is shutting down.
    Shutdown,
    Other(String),
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleClaim => f.write_str("stale_claim"),
            Self::Reassignment => f.write_str("reassignment"),
            Self::NoCommits => f.write_str("no_commits_retry"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// A task with its queue bookkeeping.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Task,
    pub state: TaskState,
    pub instance_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_release_reason: Option<ReleaseReason>,
}

/// Immutable counts-per-state snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub claimed: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub released: usize,
    pub reassigning: usize,
    /// Total non-terminal tasks.
    pub depth: usize,
}

impl QueueStatus {
    /// Tasks eligible for a claim right now.
    pub fn claimable(&self) -> usize {
        self.pending + self.released + self.reassigning
    }

    /// Tasks currently held by an instance.
    pub fn in_flight(&self) -> usize {
        self.claimed + self.running
    }
}

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task already enqueued: {0}")]
    Duplicate(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },
}

struct QueueInner {
    tasks: HashMap<String, QueuedTask>,
    /// Successfully completed task IDs; dependency satisfaction reads this.
    satisfied: HashSet<String>,
    /// When set, only members are eligible for claims (group gating).
    /// `None` falls back to raw dependency-graph readiness.
    group_gate: Option<HashSet<String>>,
}

/// The task queue.
pub struct TaskQueue {
    inner: RwLock<QueueInner>,
    bus: Arc<EventBus>,
}

impl TaskQueue {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(QueueInner {
                tasks: HashMap::new(),
                satisfied: HashSet::new(),
                group_gate: None,
            }),
            bus,
        }
    }

    /// Register a task in pending state. Fails if the ID already exists.
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let event = {
            let mut inner = self.write();
            if inner.tasks.contains_key(&task.id) {
                return Err(QueueError::Duplicate(task.id));
            }
            let id = task.id.clone();
            inner.tasks.insert(
                id,
                QueuedTask {
                    task,
                    state: TaskState::Pending,
                    instance_id: None,
                    updated_at: Utc::now(),
                    retry_count: 0,
                    last_release_reason: None,
                },
            );
            depth_event(&inner)
        };
        self.bus.publish(&event);
        Ok(())
    }

    /// Restrict claims to the given task IDs (the current execution
    /// group), or lift the restriction with `None`.
    pub fn set_group_gate(&self, gate: Option<HashSet<String>>) {
        self.write().group_gate = gate;
    }

    /// Atomically claim the most eligible task for an instance.
    ///
    /// Eligible: claimable state, all dependencies satisfied, and inside
    /// the group gate when one is set. Tie-break: lower priority number,
    /// then lexicographic task ID. Returns `None` when nothing is
    /// eligible.
    pub fn claim_next(&self, instance_id: &str) -> Result<Option<Task>, QueueError> {
        let (task, events) = {
            let mut inner = self.write();

            let best = inner
                .tasks
                .values()
                .filter(|qt| qt.state.is_claimable())
                .filter(|qt| {
                    qt.task
                        .depends_on
                        .iter()
                        .all(|dep| inner.satisfied.contains(dep))
                })
                .filter(|qt| {
                    inner
                        .group_gate
                        .as_ref()
                        .is_none_or(|gate| gate.contains(&qt.task.id))
                })
                .min_by(|a, b| {
                    (a.task.priority, a.task.id.as_str())
                        .cmp(&(b.task.priority, b.task.id.as_str()))
                })
                .map(|qt| qt.task.id.clone());

            let Some(task_id) = best else {
                return Ok(None);
            };

            let entry = inner.tasks.get_mut(&task_id).expect("selected above");
            entry.state = TaskState::Claimed;
            entry.instance_id = Some(instance_id.to_string());
            entry.updated_at = Utc::now();
            let task = entry.task.clone();

            let events = vec![
                Event::TaskClaimed {
                    task_id,
                    instance_id: instance_id.to_string(),
                },
                depth_event(&inner),
            ];
            (task, events)
        };

        for event in &events {
            self.bus.publish(event);
        }
        Ok(Some(task))
    }

    /// Transition a claimed task to running.
    pub fn mark_running(&self, task_id: &str) -> Result<(), QueueError> {
        let event = {
            let mut inner = self.write();
            let entry = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
            if entry.state != TaskState::Claimed {
                return Err(QueueError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: entry.state,
                    to: TaskState::Running,
                });
            }
            entry.state = TaskState::Running;
            entry.updated_at = Utc::now();
            Event::TaskRunning {
                task_id: task_id.to_string(),
                instance_id: entry.instance_id.clone().unwrap_or_default(),
            }
        };
        self.bus.publish(&event);
        Ok(())
    }

    /// Terminally complete a running task, successfully or not.
    pub fn complete(&self, task_id: &str, success: bool) -> Result<(), QueueError> {
        let events = {
            let mut inner = self.write();
            let entry = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
            if entry.state != TaskState::Running {
                return Err(QueueError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: entry.state,
                    to: if success {
                        TaskState::Completed
                    } else {
                        TaskState::Failed
                    },
                });
            }
            let instance_id = entry.instance_id.take();
            entry.state = if success {
                TaskState::Completed
            } else {
                TaskState::Failed
            };
            entry.updated_at = Utc::now();
            if success {
                inner.satisfied.insert(task_id.to_string());
            }
            vec![
                Event::TaskCompleted {
                    task_id: task_id.to_string(),
                    instance_id,
                    success,
                },
                depth_event(&inner),
            ]
        };
        for event in &events {
            self.bus.publish(event);
        }
        Ok(())
    }

    /// Return a claimed or running task to the queue with an incremented
    /// retry count.
    pub fn release(&self, task_id: &str, reason: ReleaseReason) -> Result<(), QueueError> {
        let events = {
            let mut inner = self.write();
            let entry = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;
            let to = if reason == ReleaseReason::Reassignment {
                TaskState::Reassigning
            } else {
                TaskState::Released
            };
            if !matches!(entry.state, TaskState::Claimed | TaskState::Running) {
                return Err(QueueError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: entry.state,
                    to,
                });
            }
            let instance_id = entry.instance_id.take();
            entry.state = to;
            entry.retry_count += 1;
            entry.updated_at = Utc::now();
            entry.last_release_reason = Some(reason.clone());
            vec![
                Event::TaskReleased {
                    task_id: task_id.to_string(),
                    instance_id,
                    reason: reason.to_string(),
                    retry_count: entry.retry_count,
                },
                depth_event(&inner),
            ]
        };
        for event in &events {
            self.bus.publish(event);
        }
        Ok(())
    }

    /// Release every claim older than `timeout` that never started
    /// running. Returns the released task IDs.
    pub fn release_stale_claims(&self, timeout: Duration) -> Vec<String> {
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_sub_signed(timeout));
        let Some(cutoff) = cutoff else {
            return Vec::new();
        };
        let stale: Vec<String> = {
            let inner = self.read();
            inner
                .tasks
                .values()
                .filter(|qt| qt.state == TaskState::Claimed && qt.updated_at < cutoff)
                .map(|qt| qt.task.id.clone())
                .collect()
        };
        let mut released = Vec::with_capacity(stale.len());
        for task_id in stale {
            match self.release(&task_id, ReleaseReason::StaleClaim) {
                Ok(()) => released.push(task_id),
                // Lost a race with a legitimate transition; nothing to do.
                Err(QueueError::InvalidTransition { .. }) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "stale-claim sweep failed");
                }
            }
        }
        released
    }

    /// Tasks currently claimed or running on an instance, ordered by
    /// ascending priority.
    pub fn instance_tasks(&self, instance_id: &str) -> Vec<Task> {
        let inner = self.read();
        let mut tasks: Vec<&QueuedTask> = inner
            .tasks
            .values()
            .filter(|qt| {
                matches!(qt.state, TaskState::Claimed | TaskState::Running)
                    && qt.instance_id.as_deref() == Some(instance_id)
            })
            .collect();
        tasks.sort_by(|a, b| {
            (a.task.priority, a.task.id.as_str()).cmp(&(b.task.priority, b.task.id.as_str()))
        });
        tasks.into_iter().map(|qt| qt.task.clone()).collect()
    }

    /// Current counts-per-state snapshot.
    pub fn status(&self) -> QueueStatus {
        status_of(&self.read())
    }

    /// Bookkeeping for a single task, if enqueued.
    pub fn get(&self, task_id: &str) -> Option<QueuedTask> {
        self.read().tasks.get(task_id).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, QueueInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, QueueInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn status_of(inner: &QueueInner) -> QueueStatus {
    let mut status = QueueStatus::default();
    for qt in inner.tasks.values() {
        match qt.state {
            TaskState::Pending => status.pending += 1,
            TaskState::Claimed => status.claimed += 1,
            TaskState::Running => status.running += 1,
            TaskState::Completed => status.completed += 1,
            TaskState::Failed => status.failed += 1,
            TaskState::Released => status.released += 1,
            TaskState::Reassigning => status.reassigning += 1,
        }
        if !qt.state.is_terminal() {
            status.depth += 1;
        }
    }
    status
}

fn depth_event(inner: &QueueInner) -> Event {
    let status = status_of(inner);
    Event::QueueDepthChanged {
        depth: status.depth,
        pending: status.claimable(),
    }
}
