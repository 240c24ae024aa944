//! Coordinator integration tests against the real queue and bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use claudio_core::coordinator::{Coordinator, CoordinatorConfig, QueueOps, ScalingAction};
use claudio_core::events::{Event, EventBus, EventKind};
use claudio_core::plan::{Complexity, Task};
use claudio_core::queue::TaskQueue;
use claudio_test_utils::init_test_logging;

fn task(id: &str, priority: i32) -> Task {
    Task {
        id: id.to_string(),
        title: format!("Task {id}"),
        description: String::new(),
        files: vec![],
        depends_on: vec![],
        priority,
        complexity: Complexity::Medium,
        no_code: false,
    }
}

fn setup(
    rebalance_interval: Duration,
) -> (Arc<EventBus>, Arc<TaskQueue>, Arc<Coordinator>) {
    let bus = Arc::new(EventBus::new());
    let queue = Arc::new(TaskQueue::new(Arc::clone(&bus)));
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&queue) as Arc<dyn QueueOps>,
        Arc::clone(&bus),
        CoordinatorConfig {
            max_tasks_per_instance: 2,
            rebalance_interval,
        },
    ));
    (bus, queue, coordinator)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rebalance_moves_lowest_priority_task_to_least_loaded_instance() {
    init_test_logging();
    // Long interval: the loop exists but never ticks during the test; we
    // drive the pass by hand for determinism.
    let (bus, queue, coordinator) = setup(Duration::from_secs(3600));
    coordinator.start();

    let reassigned: Arc<Mutex<Vec<(String, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&reassigned);
    bus.subscribe(EventKind::TaskReassigned, move |event| {
        if let Event::TaskReassigned {
            task_id,
            from_instance,
            to_instance,
        } = event
        {
            r.lock().unwrap().push((
                task_id.clone(),
                from_instance.clone(),
                to_instance.clone(),
            ));
        }
    });

    // instance-a holds five claims (priorities 1..5), instance-b one.
    for i in 1..=6 {
        queue.enqueue(task(&format!("t{i}"), i)).unwrap();
    }
    for _ in 0..5 {
        queue.claim_next("instance-a").unwrap().unwrap();
    }
    queue.claim_next("instance-b").unwrap().unwrap();

    let workload = coordinator.workload_distribution();
    assert_eq!(workload.get("instance-a"), Some(&5));
    assert_eq!(workload.get("instance-b"), Some(&1));

    coordinator.rebalance_once();

    // The busiest instance's lowest-priority claim (t5) moved to the
    // least-loaded instance, and the event names exactly that task.
    let events = reassigned.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![(
            "t5".to_string(),
            "instance-a".to_string(),
            "instance-b".to_string()
        )]
    );

    let workload = coordinator.workload_distribution();
    assert_eq!(workload.get("instance-a"), Some(&4));
    assert_eq!(workload.get("instance-b"), Some(&2));

    let b_tasks = queue.instance_tasks("instance-b");
    assert!(b_tasks.iter().any(|t| t.id == "t5"));

    coordinator.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reassignment_event_reports_intent_not_claim_result() {
    init_test_logging();
    let (bus, queue, coordinator) = setup(Duration::from_secs(3600));
    coordinator.start();

    let reassigned: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&reassigned);
    bus.subscribe(EventKind::TaskReassigned, move |event| {
        if let Event::TaskReassigned { task_id, .. } = event {
            r.lock().unwrap().push(task_id.clone());
        }
    });

    // instance-a claims the low-priority task; a higher-priority task
    // stays pending, so the post-release claim will pick it instead.
    queue.enqueue(task("low", 9)).unwrap();
    let claimed = queue.claim_next("instance-a").unwrap().unwrap();
    assert_eq!(claimed.id, "low");
    queue.enqueue(task("urgent", 0)).unwrap();

    let claim_result = coordinator
        .reassign("low", "instance-a", "instance-b")
        .unwrap()
        .expect("instance-b should claim something");

    // The queue handed over the higher-priority task, but the event
    // documents the reassignment intent: the released task.
    assert_eq!(claim_result.id, "urgent");
    assert_eq!(reassigned.lock().unwrap().clone(), vec!["low".to_string()]);

    coordinator.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scaling_signals_are_debounced() {
    init_test_logging();
    // One-hour window: only the first depth change may produce a signal.
    let (bus, queue, coordinator) = setup(Duration::from_secs(3600));
    coordinator.start();

    let signals = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&signals);
    bus.subscribe(EventKind::ScalingSignal, move |event| {
        if let Event::ScalingSignal { recommendation } = event {
            assert_eq!(recommendation.action, ScalingAction::Up);
            s.fetch_add(1, Ordering::SeqCst);
        }
    });

    // Two depth changes within a millisecond: pending work with no
    // instances recommends scaling up, but only once.
    queue.enqueue(task("t1", 0)).unwrap();
    queue.enqueue(task("t2", 0)).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(signals.load(Ordering::SeqCst), 1);

    coordinator.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workload_counts_match_queue_in_flight() {
    init_test_logging();
    let (_bus, queue, coordinator) = setup(Duration::from_secs(3600));
    coordinator.start();

    for i in 1..=4 {
        queue.enqueue(task(&format!("t{i}"), i)).unwrap();
    }
    queue.claim_next("instance-a").unwrap();
    queue.claim_next("instance-a").unwrap();
    queue.claim_next("instance-b").unwrap();
    queue.mark_running("t1").unwrap();
    queue.complete("t1", true).unwrap();

    // Handlers run synchronously on the publisher's thread, so at
    // quiescence the workload map agrees with the queue.
    let workload = coordinator.workload_distribution();
    let total: usize = workload.values().sum();
    assert_eq!(total, queue.status().in_flight());

    coordinator.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_interval_disables_the_rebalance_loop() {
    init_test_logging();
    let (_bus, queue, coordinator) = setup(Duration::ZERO);
    coordinator.start();

    // Build an imbalance that a ticking loop would correct.
    for i in 1..=5 {
        queue.enqueue(task(&format!("t{i}"), i)).unwrap();
    }
    for _ in 0..4 {
        queue.claim_next("instance-a").unwrap();
    }
    queue.claim_next("instance-b").unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    // No background rebalancing happened.
    let workload = coordinator.workload_distribution();
    assert_eq!(workload.get("instance-a"), Some(&4));
    assert_eq!(workload.get("instance-b"), Some(&1));

    coordinator.stop().await;
}
