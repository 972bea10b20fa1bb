pub mod cluster;
pub mod job;
pub mod queue;

pub use cluster::{ClusterState, NodeHealth, NodeReport, NodeStatus};
pub use job::{Job, JobId, JobStatus};
pub use queue::{JobCounts, JobQueue};
