//! In-process event bus.
//!
//! Single-writer, multi-subscriber: queue mutations, verifier decisions,
//! and consolidation milestones publish typed events; the coordinator and
//! any observing front end subscribe per event kind.
//!
//! `publish` dispatches synchronously under the bus's read lock. Handlers
//! must be non-blocking and must not re-enter the bus while holding any
//! caller-side lock; a handler that needs to publish defers the publish to
//! another thread (the coordinator uses a bounded channel for this).

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::coordinator::ScalingRecommendation;

/// Discriminant of an [`Event`], used for per-kind subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskClaimed,
    TaskRunning,
    TaskCompleted,
    TaskReleased,
    TaskReassigned,
    QueueDepthChanged,
    ScalingSignal,
    VerificationRetry,
    VerificationWarning,
    VerificationFailed,
    GroupAdvanced,
    GroupPartialFailure,
    GroupConsolidated,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskClaimed => "task_claimed",
            Self::TaskRunning => "task_running",
            Self::TaskCompleted => "task_completed",
            Self::TaskReleased => "task_released",
            Self::TaskReassigned => "task_reassigned",
            Self::QueueDepthChanged => "depth_changed",
            Self::ScalingSignal => "scaling_signal",
            Self::VerificationRetry => "verification_retry",
            Self::VerificationWarning => "verification_warning",
            Self::VerificationFailed => "verification_failed",
            Self::GroupAdvanced => "group_advanced",
            Self::GroupPartialFailure => "group_partial_failure",
            Self::GroupConsolidated => "group_consolidated",
        };
        f.write_str(s)
    }
}

/// A typed bus event. Every state change carries enough context to render
/// a human-readable reason (see [`Event::describe`]).
#[derive(Debug, Clone)]
pub enum Event {
    TaskClaimed {
        task_id: String,
        instance_id: String,
    },
    TaskRunning {
        task_id: String,
        instance_id: String,
    },
    TaskCompleted {
        task_id: String,
        instance_id: Option<String>,
        success: bool,
    },
    TaskReleased {
        task_id: String,
        instance_id: Option<String>,
        reason: String,
        retry_count: u32,
    },
    /// Rebalancing intent: names the task the coordinator released, even
    /// when the target instance's subsequent claim returns a different
    /// task.
    TaskReassigned {
        task_id: String,
        from_instance: String,
        to_instance: String,
    },
    QueueDepthChanged {
        depth: usize,
        pending: usize,
    },
    ScalingSignal {
        recommendation: ScalingRecommendation,
    },
    VerificationRetry {
        task_id: String,
        attempt: u32,
        max_retries: u32,
    },
    VerificationWarning {
        task_id: String,
        message: String,
    },
    VerificationFailed {
        task_id: String,
        attempts: u32,
        reason: String,
    },
    GroupAdvanced {
        group_index: usize,
    },
    GroupPartialFailure {
        group_index: usize,
    },
    GroupConsolidated {
        group_index: usize,
        branch: String,
        conflicts: usize,
    },
}

impl Event {
    /// The kind used for subscription matching.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TaskClaimed { .. } => EventKind::TaskClaimed,
            Self::TaskRunning { .. } => EventKind::TaskRunning,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskReleased { .. } => EventKind::TaskReleased,
            Self::TaskReassigned { .. } => EventKind::TaskReassigned,
            Self::QueueDepthChanged { .. } => EventKind::QueueDepthChanged,
            Self::ScalingSignal { .. } => EventKind::ScalingSignal,
            Self::VerificationRetry { .. } => EventKind::VerificationRetry,
            Self::VerificationWarning { .. } => EventKind::VerificationWarning,
            Self::VerificationFailed { .. } => EventKind::VerificationFailed,
            Self::GroupAdvanced { .. } => EventKind::GroupAdvanced,
            Self::GroupPartialFailure { .. } => EventKind::GroupPartialFailure,
            Self::GroupConsolidated { .. } => EventKind::GroupConsolidated,
        }
    }

    /// Human-readable account of the state change.
    pub fn describe(&self) -> String {
        match self {
            Self::TaskClaimed {
                task_id,
                instance_id,
            } => format!("task {task_id} claimed by {instance_id}"),
            Self::TaskRunning {
                task_id,
                instance_id,
            } => format!("task {task_id} running on {instance_id}"),
            Self::TaskCompleted {
                task_id, success, ..
            } => {
                if *success {
                    format!("task {task_id} completed")
                } else {
                    format!("task {task_id} failed permanently")
                }
            }
            Self::TaskReleased {
                task_id,
                reason,
                retry_count,
                ..
            } => format!("task {task_id} released ({reason}), retry {retry_count}"),
            Self::TaskReassigned {
                task_id,
                from_instance,
                to_instance,
            } => format!("task {task_id} reassigned {from_instance} -> {to_instance}"),
            Self::QueueDepthChanged { depth, pending } => {
                format!("queue depth {depth} ({pending} pending)")
            }
            Self::ScalingSignal { recommendation } => format!(
                "scaling {}: target {} ({})",
                recommendation.action, recommendation.target_instances, recommendation.reason
            ),
            Self::VerificationRetry {
                task_id,
                attempt,
                max_retries,
            } => format!("task {task_id} produced no commits, retry {attempt}/{max_retries}"),
            Self::VerificationWarning { task_id, message } => {
                format!("verification warning for {task_id}: {message}")
            }
            Self::VerificationFailed {
                task_id,
                attempts,
                reason,
            } => format!("task {task_id} failed verification after {attempts} attempts ({reason})"),
            Self::GroupAdvanced { group_index } => {
                format!("advanced to execution group {group_index}")
            }
            Self::GroupPartialFailure { group_index } => {
                format!("execution group {group_index} finished with partial failure")
            }
            Self::GroupConsolidated {
                group_index,
                branch,
                conflicts,
            } => format!(
                "group {group_index} consolidated onto {branch} ({conflicts} conflict(s))"
            ),
        }
    }
}

/// Opaque subscription handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    kind: EventKind,
    handler: Handler,
}

/// Thread-safe in-process event bus.
#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind. Returns the ID used to
    /// unsubscribe.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subs.insert(
            id,
            Subscription {
                kind,
                handler: Box::new(handler),
            },
        );
        SubscriptionId(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subs.remove(&id.0).is_some()
    }

    /// Dispatch an event to every handler subscribed to its kind, on the
    /// caller's thread, under the bus read lock.
    pub fn publish(&self, event: &Event) {
        let kind = event.kind();
        tracing::debug!(event = %kind, "{}", event.describe());
        let subs = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        for sub in subs.values() {
            if sub.kind == kind {
                (sub.handler)(event);
            }
        }
    }

    /// Number of live subscriptions. Exposed for testing cleanup.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
