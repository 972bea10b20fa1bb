use std::time::{Duration, Instant};

use serde_json::{json, Map};

use pln_cluster::scheduler::cluster::{ClusterState, NodeHealth, NodeStatus};
use pln_cluster::scheduler::job::{Job, JobId, JobStatus};
use pln_cluster::scheduler::queue::JobQueue;

fn job(id: u64) -> Job {
    Job::new(JobId::from(id), Map::new())
}

#[test]
fn test_job_creation() {
    let job = Job::from_description(json!({"jobid": "doc-1", "text": "hello"})).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.id, JobId::from("doc-1"));
    assert_eq!(job.payload.get("text"), Some(&json!("hello")));
    assert!(job.dispatched_at.is_none());
}

#[test]
fn test_job_queue_operations() {
    let mut queue = JobQueue::new();

    assert!(queue.add_job(job(1)));
    assert!(queue.add_job(job(2)));

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.active_ids(), vec![JobId::from(1), JobId::from(2)]);

    let first = queue.get_job(1).unwrap();
    assert_eq!(first.id, JobId::from(1));
    assert_eq!(first.status, JobStatus::Queued);
}

#[test]
fn test_dispatch_is_fifo() {
    let mut queue = JobQueue::new();
    for id in [5, 3, 9] {
        queue.add_job(job(id));
    }

    let order: Vec<JobId> = std::iter::from_fn(|| queue.dispatch_next())
        .map(|j| j.id)
        .collect();
    assert_eq!(order, vec![JobId::from(5), JobId::from(3), JobId::from(9)]);
    assert!(!queue.has_pending());

    let counts = queue.counts();
    assert_eq!(counts.queued, 0);
    assert_eq!(counts.dispatched, 3);
}

#[test]
fn test_dispatched_job_is_not_dispatched_twice() {
    let mut queue = JobQueue::new();
    queue.add_job(job(1));

    let dispatched = queue.dispatch_next().unwrap();
    assert_eq!(dispatched.status, JobStatus::Dispatched);
    assert!(queue.dispatch_next().is_none());

    // Requeueing an already queued job is a no-op.
    assert!(queue.requeue(dispatched.seq));
    assert!(!queue.requeue(dispatched.seq));
    assert_eq!(queue.dispatch_next().unwrap().seq, dispatched.seq);
    assert!(queue.dispatch_next().is_none());
}

#[test]
fn test_duplicate_ids_are_separate_entries() {
    let mut queue = JobQueue::new();
    queue.add_job(job(7));
    queue.add_job(job(7));
    assert_eq!(queue.len(), 2);

    queue.dispatch_next();
    queue.dispatch_next();

    // A result retires the oldest dispatched entry with that id.
    let finished = queue.complete(&JobId::from(7), true).unwrap();
    assert_eq!(finished.seq, 1);
    assert_eq!(finished.status, JobStatus::Done);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.counts().done, 1);
}

#[test]
fn test_complete_requires_dispatch() {
    let mut queue = JobQueue::new();
    queue.add_job(job(1));
    assert!(queue.complete(&JobId::from(1), true).is_none());

    queue.dispatch_next();
    let failed = queue.complete(&JobId::from(1), false).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.finished_at.is_some());
    assert!(queue.is_empty());
    assert_eq!(queue.counts().failed, 1);
}

#[test]
fn test_queue_capacity() {
    let mut queue = JobQueue::with_capacity(3);
    assert!(queue.add_batch(vec![job(1), job(2)]));

    // All-or-nothing: two more would exceed the capacity.
    assert!(!queue.add_batch(vec![job(3), job(4)]));
    assert_eq!(queue.len(), 2);

    assert!(queue.add_job(job(3)));
    assert!(queue.is_full());
    assert!(!queue.add_job(job(4)));

    // Retired jobs free capacity.
    queue.dispatch_next();
    queue.complete(&JobId::from(1), true);
    assert!(queue.add_job(job(4)));
}

#[test]
fn test_batches_keep_order_across_submissions() {
    let mut queue = JobQueue::new();
    let batch = |offset: u64| (0..10).map(|i| job(i + offset)).collect::<Vec<_>>();
    assert!(queue.add_batch(batch(0)));
    assert!(queue.add_batch(batch(0)));
    assert_eq!(queue.len(), 20);

    let ids = queue.active_ids();
    assert_eq!(ids[0], JobId::from(0));
    assert_eq!(ids[9], JobId::from(9));
    assert_eq!(ids[10], JobId::from(0));
}

#[test]
fn test_node_registration() {
    let mut cluster = ClusterState::new(Duration::from_secs(5));
    cluster.register("10.0.0.1", 4);
    cluster.register("10.0.0.2", 2);

    assert_eq!(cluster.len(), 2);
    assert_eq!(cluster.alive_count(), 2);
    let node = cluster.get("10.0.0.1").unwrap();
    assert_eq!(node.capacity, 4);
    assert_eq!(node.status, NodeStatus::Alive);
}

#[test]
fn test_heartbeat_registers_unknown_node() {
    let mut cluster = ClusterState::new(Duration::from_secs(5));
    cluster.heartbeat(
        "n1",
        NodeHealth {
            load: 2,
            capacity: Some(8),
            failed_workers: 1,
        },
    );

    let report = &cluster.snapshot()["n1"];
    assert_eq!(report.status, NodeStatus::Alive);
    assert_eq!(report.load, 2);
    assert_eq!(report.capacity, 8);
    assert_eq!(report.failed_workers, 1);
}

#[test]
fn test_node_timeout_boundaries() {
    let timeout = Duration::from_millis(200);
    let mut cluster = ClusterState::new(timeout);
    cluster.register("n1", 1);
    let registered_at = cluster.get("n1").unwrap().last_heartbeat;

    // Not before the timeout.
    assert!(cluster.sweep(registered_at + timeout - Duration::from_millis(1)).is_empty());
    assert_eq!(cluster.get("n1").unwrap().status, NodeStatus::Alive);

    // Once the timeout has elapsed.
    assert_eq!(cluster.sweep(registered_at + timeout), vec!["n1".to_string()]);
    assert_eq!(cluster.get("n1").unwrap().status, NodeStatus::Unreachable);
    assert_eq!(cluster.alive_count(), 0);

    // Still visible, and only reported once.
    assert_eq!(cluster.len(), 1);
    assert!(cluster.sweep(Instant::now() + timeout * 2).is_empty());
}

#[test]
fn test_unreachable_node_recovers_on_heartbeat() {
    let mut cluster = ClusterState::new(Duration::from_millis(10));
    cluster.register("n1", 1);
    cluster.sweep(Instant::now() + Duration::from_millis(50));
    assert_eq!(cluster.get("n1").unwrap().status, NodeStatus::Unreachable);

    cluster.heartbeat("n1", NodeHealth::default());
    assert_eq!(cluster.get("n1").unwrap().status, NodeStatus::Alive);
}

#[test]
fn test_empty_cluster_snapshot() {
    let cluster = ClusterState::new(Duration::from_secs(1));
    assert!(cluster.is_empty());
    assert!(cluster.snapshot().is_empty());
}
