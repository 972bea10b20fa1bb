use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Alive,
    Unreachable,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Alive => write!(f, "alive"),
            NodeStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Health figures a SlaveDriver reports with each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    #[serde(default)]
    pub load: usize,
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub failed_workers: usize,
}

/// Node tracking state
#[derive(Debug, Clone)]
pub struct NodeState {
    pub id: String,
    pub status: NodeStatus,
    pub last_heartbeat: Instant,
    pub last_seen: DateTime<Utc>,
    pub capacity: usize,
    pub load: usize,
    pub failed_workers: usize,
}

impl NodeState {
    pub fn new(id: String, capacity: usize) -> Self {
        Self {
            id,
            status: NodeStatus::Alive,
            last_heartbeat: Instant::now(),
            last_seen: Utc::now(),
            capacity,
            load: 0,
            failed_workers: 0,
        }
    }

    pub fn update_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
        self.last_seen = Utc::now();
        self.status = NodeStatus::Alive;
    }

    pub fn is_alive(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) < timeout
    }
}

/// Externally visible view of a node (internal timers stripped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub capacity: usize,
    pub load: usize,
    pub failed_workers: usize,
}

impl From<&NodeState> for NodeReport {
    fn from(node: &NodeState) -> Self {
        Self {
            status: node.status,
            last_heartbeat: node.last_seen,
            capacity: node.capacity,
            load: node.load,
            failed_workers: node.failed_workers,
        }
    }
}

/// Membership view of the cluster, keyed by node identifier.
///
/// Nodes are never removed; a node that stops reporting is only marked
/// unreachable so it stays visible in status snapshots.
#[derive(Debug)]
pub struct ClusterState {
    nodes: BTreeMap<String, NodeState>,
    heartbeat_timeout: Duration,
}

impl ClusterState {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            nodes: BTreeMap::new(),
            heartbeat_timeout,
        }
    }

    /// Register a node (or refresh it if already known).
    pub fn register(&mut self, node_id: &str, capacity: usize) {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.capacity = capacity;
                node.update_heartbeat();
            }
            None => {
                self.nodes
                    .insert(node_id.to_string(), NodeState::new(node_id.to_string(), capacity));
                tracing::info!(node = node_id, capacity, "Node registered");
            }
        }
    }

    /// Record a heartbeat, registering the node on first contact.
    pub fn heartbeat(&mut self, node_id: &str, health: NodeHealth) {
        let node = self.nodes.entry(node_id.to_string()).or_insert_with(|| {
            tracing::info!(node = node_id, "Node registered by heartbeat");
            NodeState::new(node_id.to_string(), health.capacity.unwrap_or(0))
        });

        if node.status == NodeStatus::Unreachable {
            tracing::info!(node = node_id, "Node reachable again");
        }
        node.update_heartbeat();
        node.load = health.load;
        node.failed_workers = health.failed_workers;
        if let Some(capacity) = health.capacity {
            node.capacity = capacity;
        }
    }

    /// Mark every node whose last report is older than the timeout as
    /// unreachable. Returns the ids that changed state.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let mut changed = Vec::new();
        for node in self.nodes.values_mut() {
            if node.status == NodeStatus::Alive && !node.is_alive(self.heartbeat_timeout, now) {
                node.status = NodeStatus::Unreachable;
                tracing::warn!(
                    node = %node.id,
                    silent_ms = now.saturating_duration_since(node.last_heartbeat).as_millis() as u64,
                    "Node marked unreachable"
                );
                changed.push(node.id.clone());
            }
        }
        changed
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeState> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn alive_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Alive)
            .count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, NodeReport> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), NodeReport::from(node)))
            .collect()
    }
}
