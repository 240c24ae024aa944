//! Adaptive coordinator ("lead"): per-instance workload tracking, scaling
//! recommendations, and periodic rebalancing.
//!
//! The coordinator consumes queue events and maintains a map of
//! `instance ID -> active task count`. It recommends scaling up when
//! pending work exceeds capacity, down when instances sit idle, and
//! periodically moves one task from the busiest instance to the least
//! loaded one.
//!
//! Lock discipline: the bus holds its read lock during dispatch, and the
//! coordinator's handlers take the coordinator mutex. Handlers therefore
//! only mutate local state and never publish; follow-on publishes (the
//! debounced scaling signal) are deferred to the background loop through a
//! bounded channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventBus, EventKind, SubscriptionId};
use crate::plan::Task;
use crate::queue::{QueueError, QueueStatus, ReleaseReason, TaskQueue};

/// The queue capabilities the coordinator depends on.
///
/// Narrower than [`TaskQueue`] so the coordinator can be tested against a
/// mock and the queue can evolve independently.
pub trait QueueOps: Send + Sync {
    fn status(&self) -> QueueStatus;
    fn claim_next(&self, instance_id: &str) -> Result<Option<Task>, QueueError>;
    fn release(&self, task_id: &str, reason: ReleaseReason) -> Result<(), QueueError>;
    fn instance_tasks(&self, instance_id: &str) -> Vec<Task>;
}

impl QueueOps for TaskQueue {
    fn status(&self) -> QueueStatus {
        TaskQueue::status(self)
    }

    fn claim_next(&self, instance_id: &str) -> Result<Option<Task>, QueueError> {
        TaskQueue::claim_next(self, instance_id)
    }

    fn release(&self, task_id: &str, reason: ReleaseReason) -> Result<(), QueueError> {
        TaskQueue::release(self, task_id, reason)
    }

    fn instance_tasks(&self, instance_id: &str) -> Vec<Task> {
        TaskQueue::instance_tasks(self, instance_id)
    }
}

/// Direction of a scaling recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    None,
    Up,
    Down,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Up => "up",
            Self::Down => "down",
        };
        f.write_str(s)
    }
}

/// A scaling recommendation with its target instance count and rationale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingRecommendation {
    pub action: ScalingAction,
    pub target_instances: usize,
    pub reason: String,
}

impl ScalingRecommendation {
    fn none(target_instances: usize, reason: &str) -> Self {
        Self {
            action: ScalingAction::None,
            target_instances,
            reason: reason.to_string(),
        }
    }
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Workload an instance can carry before a scale-up is recommended.
    pub max_tasks_per_instance: usize,
    /// Interval of the rebalance loop, doubling as the minimum spacing
    /// between scaling signals. Zero disables the rebalance ticks.
    pub rebalance_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_instance: 2,
            rebalance_interval: Duration::from_secs(30),
        }
    }
}

struct LeadState {
    workload: HashMap<String, usize>,
    last_signal: Option<Instant>,
}

struct LoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The adaptive coordinator.
pub struct Coordinator {
    queue: Arc<dyn QueueOps>,
    bus: Arc<EventBus>,
    config: CoordinatorConfig,
    state: Mutex<LeadState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    signal_tx: Mutex<Option<mpsc::Sender<()>>>,
    runtime: Mutex<Option<LoopHandle>>,
}

impl Coordinator {
    pub fn new(
        queue: Arc<dyn QueueOps>,
        bus: Arc<EventBus>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            queue,
            bus,
            config,
            state: Mutex::new(LeadState {
                workload: HashMap::new(),
                last_signal: None,
            }),
            subscriptions: Mutex::new(Vec::new()),
            signal_tx: Mutex::new(None),
            runtime: Mutex::new(None),
        }
    }

    /// Subscribe to queue events and spawn the background loop.
    ///
    /// Must be called from within a tokio runtime. Calling `start` on an
    /// already-started coordinator is a no-op.
    pub fn start(self: &Arc<Self>) {
        {
            let runtime = self.lock_runtime();
            if runtime.is_some() {
                return;
            }
        }

        let (tx, rx) = mpsc::channel::<()>(8);
        *self.lock_signal_tx() = Some(tx);

        let kinds = [
            EventKind::TaskClaimed,
            EventKind::TaskReleased,
            EventKind::QueueDepthChanged,
            EventKind::TaskCompleted,
        ];
        {
            let mut subs = self.lock_subscriptions();
            for kind in kinds {
                let weak = Arc::downgrade(self);
                subs.push(self.bus.subscribe(kind, move |event| {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.on_event(event);
                    }
                }));
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::run_loop(Arc::clone(self), cancel.clone(), rx));
        *self.lock_runtime() = Some(LoopHandle { cancel, handle });
    }

    /// Cancel the background loop, wait for it to exit, and drop every
    /// subscription made at start. Stop before start is a safe no-op.
    pub async fn stop(&self) {
        let Some(loop_handle) = self.lock_runtime().take() else {
            return;
        };
        loop_handle.cancel.cancel();
        let _ = loop_handle.handle.await;

        *self.lock_signal_tx() = None;
        let subs: Vec<SubscriptionId> = self.lock_subscriptions().drain(..).collect();
        for sub in subs {
            self.bus.unsubscribe(sub);
        }
    }

    /// Defensive copy of the per-instance workload map.
    pub fn workload_distribution(&self) -> HashMap<String, usize> {
        self.lock_state().workload.clone()
    }

    /// Compute the current scaling recommendation.
    pub fn scaling_recommendation(&self) -> ScalingRecommendation {
        // Queue status first: never hold the coordinator mutex across a
        // call into the queue.
        let status = self.queue.status();
        let workload = self.workload_distribution();

        let pending = status.claimable();
        let in_flight = status.in_flight();
        let instances = workload.len();
        let max_per = self.config.max_tasks_per_instance.max(1);

        if pending == 0 && in_flight == 0 {
            return ScalingRecommendation::none(instances, "no pending or in-flight work");
        }

        if pending > 0 && (instances == 0 || pending > instances * max_per) {
            let additional = pending.div_ceil(max_per);
            return ScalingRecommendation {
                action: ScalingAction::Up,
                target_instances: instances + additional,
                reason: format!(
                    "{pending} pending task(s) exceed the capacity of {instances} instance(s)"
                ),
            };
        }

        if pending == 0 {
            let idle = workload.values().filter(|count| **count == 0).count();
            if idle > 0 {
                return ScalingRecommendation {
                    action: ScalingAction::Down,
                    target_instances: instances - idle,
                    reason: format!("{idle} instance(s) have no active tasks"),
                };
            }
        }

        ScalingRecommendation::none(instances, "balanced")
    }

    /// Move one claim from `from_instance` to `to_instance`.
    ///
    /// Two steps: release the task citing reassignment, then claim-next
    /// for the target. The queue picks purely by priority, so the claim
    /// may return a different task than the one released; the published
    /// event names the released task because the event reports the
    /// *intent*, not the incidental claim result. The claim result is
    /// returned so callers can observe the divergence.
    pub fn reassign(
        &self,
        task_id: &str,
        from_instance: &str,
        to_instance: &str,
    ) -> Result<Option<Task>, QueueError> {
        self.queue.release(task_id, ReleaseReason::Reassignment)?;
        let claimed = self.queue.claim_next(to_instance)?;

        if let Some(ref task) = claimed {
            if task.id != task_id {
                tracing::debug!(
                    released = %task_id,
                    claimed = %task.id,
                    "reassignment claim diverged from released task"
                );
            }
        }

        self.bus.publish(&Event::TaskReassigned {
            task_id: task_id.to_string(),
            from_instance: from_instance.to_string(),
            to_instance: to_instance.to_string(),
        });

        Ok(claimed)
    }

    /// One rebalance pass: if the workload spread exceeds one task, move
    /// the busiest instance's lowest-priority task to the least loaded
    /// instance.
    pub fn rebalance_once(&self) {
        let workload = self.workload_distribution();
        if workload.len() < 2 {
            return;
        }

        // Deterministic tie-break by instance ID.
        let busiest = workload
            .iter()
            .max_by(|a, b| (a.1, std::cmp::Reverse(a.0)).cmp(&(b.1, std::cmp::Reverse(b.0))))
            .map(|(id, count)| (id.clone(), *count));
        let least = workload
            .iter()
            .min_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)))
            .map(|(id, count)| (id.clone(), *count));

        let (Some((busiest_id, max)), Some((least_id, min))) = (busiest, least) else {
            return;
        };
        if max == 0 || max - min <= 1 {
            return;
        }

        let tasks = self.queue.instance_tasks(&busiest_id);
        // instance_tasks is ordered by ascending priority; the last entry
        // is the least important claim.
        let Some(victim) = tasks.last() else {
            return;
        };

        tracing::info!(
            task_id = %victim.id,
            from = %busiest_id,
            to = %least_id,
            spread = max - min,
            "rebalancing workload"
        );

        if let Err(e) = self.reassign(&victim.id, &busiest_id, &least_id) {
            tracing::warn!(task_id = %victim.id, error = %e, "rebalance reassignment failed");
        }
    }

    /// Event handler: mutates the workload map and pokes the loop for
    /// depth changes. Never publishes (see module docs).
    fn on_event(&self, event: &Event) {
        match event {
            Event::TaskClaimed { instance_id, .. } => {
                let mut state = self.lock_state();
                *state.workload.entry(instance_id.clone()).or_insert(0) += 1;
            }
            Event::TaskReleased {
                instance_id: Some(instance_id),
                ..
            }
            | Event::TaskCompleted {
                instance_id: Some(instance_id),
                ..
            } => {
                let mut state = self.lock_state();
                if let Some(count) = state.workload.get_mut(instance_id) {
                    *count = count.saturating_sub(1);
                }
            }
            Event::QueueDepthChanged { .. } => {
                // Defer the (possible) scaling publish to the loop thread.
                if let Some(tx) = self.lock_signal_tx().as_ref() {
                    let _ = tx.try_send(());
                }
            }
            _ => {}
        }
    }

    /// Publish a scaling signal unless one was published within the
    /// debounce window or the recommendation is `none`.
    fn maybe_publish_scaling(&self) {
        let recommendation = self.scaling_recommendation();
        if recommendation.action == ScalingAction::None {
            return;
        }

        let debounce = self.config.rebalance_interval;
        {
            let mut state = self.lock_state();
            if let Some(last) = state.last_signal {
                if last.elapsed() < debounce {
                    return;
                }
            }
            state.last_signal = Some(Instant::now());
        }

        self.bus.publish(&Event::ScalingSignal { recommendation });
    }

    async fn run_loop(
        coordinator: Arc<Self>,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<()>,
    ) {
        let interval = coordinator.config.rebalance_interval;
        let mut ticker = if interval.is_zero() {
            None
        } else {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Consume the immediate first tick; rebalancing at t=0 is
            // never useful.
            ticker.tick().await;
            Some(ticker)
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = async { ticker.as_mut().expect("guarded").tick().await }, if ticker.is_some() => {
                    coordinator.rebalance_once();
                }
                poke = rx.recv() => {
                    match poke {
                        Some(()) => coordinator.maybe_publish_scaling(),
                        None => break,
                    }
                }
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LeadState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionId>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_signal_tx(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<()>>> {
        self.signal_tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_runtime(&self) -> std::sync::MutexGuard<'_, Option<LoopHandle>> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }
}
