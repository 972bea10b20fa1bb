use std::collections::HashSet;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigDocument, DriverSettings, ManagerConfig, UnknownNodePolicy};
use crate::error::{ClusterError, Result};
use crate::manager::protocol::{
    parse_submission, Ack, ConfReply, ControlReply, ControlRequest, Outcome, SinkMessage,
    StatusReply, QUEUE_FULL,
};
use crate::scheduler::{ClusterState, JobQueue};

const REQUEST_CHANNEL_CAPACITY: usize = 1024;

/// Messages for the Manager's serving loop.
#[derive(Debug)]
pub enum ManagerRequest {
    /// Job-intake body; replied with an acknowledgement.
    Submit {
        body: Bytes,
        response_tx: oneshot::Sender<Ack>,
    },
    /// Status query; the body is ignored.
    Status {
        response_tx: oneshot::Sender<StatusReply>,
    },
    /// Configuration fetch or heartbeat from a SlaveDriver.
    Control {
        body: Bytes,
        response_tx: oneshot::Sender<ControlReply>,
    },
    /// Worker result read from the sink endpoint.
    Result(SinkMessage),
    /// A dispatched job that never reached a puller.
    Requeue { seq: u64 },
    /// Which of the given nodes have not fetched their configuration yet.
    PendingNodes {
        nodes: Vec<String>,
        response_tx: oneshot::Sender<Vec<String>>,
    },
}

/// A job handed to the streaming endpoint.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub seq: u64,
    pub message: Value,
}

/// Cloneable handle endpoint tasks use to reach the serving loop.
#[derive(Debug, Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<ManagerRequest>,
}

impl CoreHandle {
    pub fn channel() -> (Self, mpsc::Receiver<ManagerRequest>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    async fn ask<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> ManagerRequest) -> Result<R> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| ClusterError::ShuttingDown)?;
        response_rx.await.map_err(|_| ClusterError::ShuttingDown)
    }

    pub async fn submit(&self, body: Bytes) -> Result<Ack> {
        self.ask(|response_tx| ManagerRequest::Submit { body, response_tx })
            .await
    }

    pub async fn status(&self) -> Result<StatusReply> {
        self.ask(|response_tx| ManagerRequest::Status { response_tx })
            .await
    }

    pub async fn control(&self, body: Bytes) -> Result<ControlReply> {
        self.ask(|response_tx| ManagerRequest::Control { body, response_tx })
            .await
    }

    pub async fn pending_nodes(&self, nodes: Vec<String>) -> Result<Vec<String>> {
        self.ask(|response_tx| ManagerRequest::PendingNodes { nodes, response_tx })
            .await
    }

    pub async fn result(&self, message: SinkMessage) -> Result<()> {
        self.tx
            .send(ManagerRequest::Result(message))
            .await
            .map_err(|_| ClusterError::ShuttingDown)
    }

    pub async fn requeue(&self, seq: u64) -> Result<()> {
        self.tx
            .send(ManagerRequest::Requeue { seq })
            .await
            .map_err(|_| ClusterError::ShuttingDown)
    }
}

/// Sole owner of the job queue and cluster state.
///
/// Every mutation happens inside [`ManagerCore::run`], one request at a time,
/// so the state needs no locking and status snapshots always reflect every
/// request answered before them.
#[derive(Debug)]
pub struct ManagerCore {
    queue: JobQueue,
    cluster: ClusterState,
    document: ConfigDocument,
    unknown_nodes: UnknownNodePolicy,
    fetched: HashSet<String>,
}

impl ManagerCore {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            queue: JobQueue::with_capacity(config.max_jobs),
            cluster: ClusterState::new(config.heartbeat_timeout),
            document: config.document.clone(),
            unknown_nodes: config.unknown_nodes,
            fetched: HashSet::new(),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    pub fn handle_submit(&mut self, body: &[u8]) -> Ack {
        let jobs = match parse_submission(body) {
            Ok(jobs) => jobs,
            Err(reason) => {
                tracing::warn!(reason = %reason, "Rejected malformed submission");
                return Ack::error(reason);
            }
        };

        let count = jobs.len();
        if !self.queue.add_batch(jobs) {
            tracing::warn!(count, queued = self.queue.len(), "Job queue at capacity, submission rejected");
            return Ack::error(QUEUE_FULL);
        }

        tracing::debug!(count, queued = self.queue.len(), "Jobs queued");
        Ack::queued()
    }

    pub fn handle_status(&mut self, now: Instant) -> StatusReply {
        self.cluster.sweep(now);
        StatusReply {
            cluster: self.cluster.snapshot(),
            active_jobs: self.queue.active_ids(),
            jobs: self.queue.counts(),
        }
    }

    pub fn handle_control(&mut self, body: &[u8]) -> ControlReply {
        match ControlRequest::decode(body) {
            Some(ControlRequest::Identity(node)) if node.trim().is_empty() => {
                ControlReply::Ack(Ack::error("empty node identity"))
            }
            Some(ControlRequest::Heartbeat { heartbeat }) if heartbeat.node.trim().is_empty() => {
                ControlReply::Ack(Ack::error("empty node identity"))
            }
            Some(ControlRequest::Identity(node)) => self.serve_localconf(&node),
            Some(ControlRequest::Heartbeat { heartbeat }) => {
                self.cluster.heartbeat(&heartbeat.node, heartbeat.health);
                tracing::trace!(node = %heartbeat.node, load = heartbeat.health.load, "Heartbeat");
                ControlReply::Ack(Ack::ok())
            }
            None => ControlReply::Ack(Ack::error("unrecognized control request")),
        }
    }

    fn serve_localconf(&mut self, node: &str) -> ControlReply {
        let declared = self.document.is_declared_node(node);
        if !declared && self.unknown_nodes == UnknownNodePolicy::Reject {
            tracing::warn!(node, "Refusing configuration to undeclared node");
            return ControlReply::Ack(Ack::error(format!("unknown node {}", node)));
        }

        let localconf = self.document.localconf_for(node);
        let capacity = match DriverSettings::from_localconf(&localconf) {
            Ok(settings) => settings.worker_count,
            Err(e) => {
                tracing::warn!(node, error = %e, "Node configuration has invalid options");
                DriverSettings::default().worker_count
            }
        };

        self.cluster.register(node, capacity);
        self.fetched.insert(node.to_string());
        tracing::info!(node, declared, "Served node configuration");
        ControlReply::Conf(ConfReply { localconf })
    }

    pub fn handle_result(&mut self, message: SinkMessage) {
        let success = message.status == Outcome::Done;
        match self.queue.complete(&message.jobid, success) {
            Some(job) => tracing::info!(
                job_id = %job.id,
                status = %job.status,
                node = message.node.as_deref().unwrap_or("-"),
                "Job finished"
            ),
            None => tracing::debug!(job_id = %message.jobid, "Result for job that is not dispatched"),
        }
    }

    pub fn requeue(&mut self, seq: u64) {
        if self.queue.requeue(seq) {
            tracing::info!(seq, "Job re-queued after failed delivery");
        }
    }

    pub fn pending_nodes(&self, nodes: &[String]) -> Vec<String> {
        nodes
            .iter()
            .filter(|n| !self.fetched.contains(*n))
            .cloned()
            .collect()
    }

    /// Move the oldest queued job to `dispatched` and build its stream message.
    pub fn next_dispatch(&mut self) -> Option<Dispatch> {
        self.queue.dispatch_next().map(|job| {
            tracing::debug!(job_id = %job.id, seq = job.seq, "Job dispatched");
            Dispatch {
                seq: job.seq,
                message: job.stream_message(),
            }
        })
    }

    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        self.cluster.sweep(now)
    }

    fn handle(&mut self, request: ManagerRequest) {
        match request {
            ManagerRequest::Submit { body, response_tx } => {
                let _ = response_tx.send(self.handle_submit(&body));
            }
            ManagerRequest::Status { response_tx } => {
                let _ = response_tx.send(self.handle_status(Instant::now()));
            }
            ManagerRequest::Control { body, response_tx } => {
                let _ = response_tx.send(self.handle_control(&body));
            }
            ManagerRequest::Result(message) => self.handle_result(message),
            ManagerRequest::Requeue { seq } => self.requeue(seq),
            ManagerRequest::PendingNodes { nodes, response_tx } => {
                let _ = response_tx.send(self.pending_nodes(&nodes));
            }
        }
    }

    /// The serving loop.
    ///
    /// Multiplexes endpoint requests, dispatch capacity on the streamer
    /// channel and the heartbeat sweep until the token is cancelled or every
    /// request sender is gone.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<ManagerRequest>,
        dispatch_tx: mpsc::Sender<Dispatch>,
        sweep_interval: Duration,
        token: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut streaming = true;

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    tracing::debug!("Serving loop cancelled");
                    break;
                }

                request = requests.recv() => {
                    match request {
                        Some(request) => self.handle(request),
                        None => break,
                    }
                }

                permit = dispatch_tx.reserve(), if streaming && self.queue.has_pending() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(dispatch) = self.next_dispatch() {
                                permit.send(dispatch);
                            }
                        }
                        Err(_) => {
                            tracing::warn!("Streaming endpoint closed, dispatch stopped");
                            streaming = false;
                        }
                    }
                }

                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }

        tracing::info!(
            active_jobs = self.queue.len(),
            nodes = self.cluster.len(),
            "Serving loop stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{JobId, NodeStatus};
    use serde_json::json;

    fn test_config() -> ManagerConfig {
        let mut doc = ConfigDocument::parse(include_str!("../../conf/pln-cluster.conf")).unwrap();
        doc.set("cluster", "nodes", "n1, n2");
        doc.set("manager", "heartbeat_timeout_ms", "100");
        doc.set("manager", "max_jobs", "5");
        ManagerConfig::from_document(doc).unwrap()
    }

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn submit_then_status_shows_job() {
        let mut core = ManagerCore::new(&test_config());
        let ack = core.handle_submit(&body(json!({"jobid": 42})));
        assert_eq!(ack, Ack::queued());

        let status = core.handle_status(Instant::now());
        assert_eq!(status.active_jobs, vec![JobId::from(42)]);
        assert!(status.cluster.is_empty());
    }

    #[test]
    fn blank_node_identity_is_refused() {
        let mut core = ManagerCore::new(&test_config());
        for request in [json!(""), json!("   "), json!({"heartbeat": {"node": "", "load": 1}})] {
            let reply = core.handle_control(&body(request));
            assert_eq!(reply, ControlReply::Ack(Ack::error("empty node identity")));
        }
        assert!(core.handle_status(Instant::now()).cluster.is_empty());
    }

    #[test]
    fn malformed_submission_gets_error_ack() {
        let mut core = ManagerCore::new(&test_config());
        let ack = core.handle_submit(b"{{nope");
        assert!(ack.is_error());
        assert!(core.queue().is_empty());
    }

    #[test]
    fn capacity_rejects_whole_batch() {
        let mut core = ManagerCore::new(&test_config());
        let batch: Vec<_> = (0..4).map(|i| json!({"jobid": i})).collect();
        assert_eq!(core.handle_submit(&body(json!(batch))), Ack::queued());

        let batch: Vec<_> = (4..6).map(|i| json!({"jobid": i})).collect();
        let ack = core.handle_submit(&body(json!(batch)));
        assert_eq!(ack, Ack::error(QUEUE_FULL));
        assert_eq!(core.queue().len(), 4);
    }

    #[test]
    fn dispatch_is_fifo_and_at_most_once() {
        let mut core = ManagerCore::new(&test_config());
        core.handle_submit(&body(json!([{"jobid": "a"}, {"jobid": "b"}])));

        let first = core.next_dispatch().unwrap();
        let second = core.next_dispatch().unwrap();
        assert_eq!(first.message["jobid"], json!("a"));
        assert_eq!(second.message["jobid"], json!("b"));
        assert!(core.next_dispatch().is_none());

        // Dispatched jobs remain active until a result arrives.
        let status = core.handle_status(Instant::now());
        assert_eq!(status.active_jobs.len(), 2);
        assert_eq!(status.jobs.dispatched, 2);
    }

    #[test]
    fn requeue_puts_job_back_in_front() {
        let mut core = ManagerCore::new(&test_config());
        core.handle_submit(&body(json!([{"jobid": 1}, {"jobid": 2}])));
        let first = core.next_dispatch().unwrap();
        core.requeue(first.seq);
        let again = core.next_dispatch().unwrap();
        assert_eq!(again.seq, first.seq);
    }

    #[test]
    fn result_retires_job() {
        let mut core = ManagerCore::new(&test_config());
        core.handle_submit(&body(json!({"jobid": 7})));
        core.next_dispatch().unwrap();

        core.handle_result(SinkMessage {
            jobid: JobId::from(7),
            status: Outcome::Failed,
            result: Value::Null,
            error: Some("boom".to_string()),
            node: None,
        });

        let status = core.handle_status(Instant::now());
        assert!(status.active_jobs.is_empty());
        assert_eq!(status.jobs.failed, 1);
    }

    #[test]
    fn localconf_registers_node() {
        let mut core = ManagerCore::new(&test_config());
        let reply = core.handle_control(br#""n1""#);
        match reply {
            ControlReply::Conf(conf) => {
                assert!(conf.localconf.contains_key("worker"));
                assert!(conf.localconf.contains_key("sink"));
                assert!(conf.localconf.contains_key("streamer"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let node = core.cluster().get("n1").unwrap();
        assert_eq!(node.status, NodeStatus::Alive);
        assert_eq!(node.capacity, 4);
        assert_eq!(core.pending_nodes(&["n1".into(), "n2".into()]), vec!["n2".to_string()]);
    }

    #[test]
    fn unknown_node_policy_reject() {
        let mut config = test_config();
        config.unknown_nodes = UnknownNodePolicy::Reject;
        let mut core = ManagerCore::new(&config);

        match core.handle_control(b"stranger") {
            ControlReply::Ack(ack) => assert!(ack.is_error()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(core.cluster().is_empty());

        assert!(matches!(core.handle_control(b"n2"), ControlReply::Conf(_)));
    }

    #[test]
    fn unknown_node_policy_default_serves_baseline() {
        let mut core = ManagerCore::new(&test_config());
        assert!(matches!(core.handle_control(b"stranger"), ControlReply::Conf(_)));
        assert!(core.cluster().contains("stranger"));
    }

    #[test]
    fn heartbeat_timeout_marks_unreachable() {
        let mut core = ManagerCore::new(&test_config());
        core.handle_control(br#"{"heartbeat": {"node": "n1", "load": 1}}"#);

        let now = Instant::now();
        assert!(core.sweep(now).is_empty());
        let later = now + Duration::from_millis(150);
        assert_eq!(core.sweep(later), vec!["n1".to_string()]);

        let status = core.handle_status(later);
        assert_eq!(status.cluster["n1"].status, NodeStatus::Unreachable);

        // A new heartbeat brings it back.
        core.handle_control(br#"{"heartbeat": {"node": "n1"}}"#);
        assert_eq!(core.cluster().get("n1").unwrap().status, NodeStatus::Alive);
    }

    #[tokio::test]
    async fn run_loop_serves_and_dispatches() {
        let config = test_config();
        let (handle, rx) = CoreHandle::channel();
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(1);
        let token = CancellationToken::new();

        let core = ManagerCore::new(&config);
        let task = tokio::spawn(core.run(rx, dispatch_tx, Duration::from_millis(50), token.clone()));

        let ack = handle
            .submit(Bytes::from(body(json!([{"jobid": 1}, {"jobid": 2}]))))
            .await
            .unwrap();
        assert_eq!(ack, Ack::queued());

        let first = dispatch_rx.recv().await.unwrap();
        let second = dispatch_rx.recv().await.unwrap();
        assert_eq!(first.message["jobid"], json!(1));
        assert_eq!(second.message["jobid"], json!(2));

        token.cancel();
        task.await.unwrap();
        assert!(matches!(handle.status().await, Err(ClusterError::ShuttingDown)));
    }
}
