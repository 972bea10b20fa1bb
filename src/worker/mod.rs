//! Worker processes: the consumers of the Manager's work stream.
//!
//! A worker holds two connections, a puller on the streaming endpoint and a
//! pusher on the sink endpoint. Each streamed job is handed to a
//! [`JobProcessor`] and the outcome is pushed as a sink message.
//!
//! # Components
//!
//! - [`JobProcessor`]: the per-job logic, opaque to the control plane
//! - [`CommandProcessor`]: runs `sh -c <command>` with the job on stdin
//! - [`run_worker`]: the pull / process / push loop
//!
//! Workers are normally started by a SlaveDriver (see
//! [`crate::slavedriver`]), which restarts them when they exit.

pub mod executor;
pub mod runner;

pub use executor::{CommandProcessor, JobOutcome, JobProcessor};
pub use runner::{run_worker, WorkerEndpoints};
