use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{DriverSettings, TransportSettings};
use crate::error::Result;
use crate::scheduler::NodeHealth;

/// Starts one worker process for a supervision slot.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, slot: usize) -> Result<Child>;
}

/// Starts workers by re-running this binary's `worker` subcommand.
///
/// Workers get the node's transport settings as flags so they accept the
/// same frame sizes the Manager streams.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    streamer: String,
    sink: String,
    command: String,
    node: String,
    transport: TransportSettings,
}

impl ProcessSpawner {
    pub fn new(
        program: impl Into<PathBuf>,
        streamer: impl Into<String>,
        sink: impl Into<String>,
        command: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            streamer: streamer.into(),
            sink: sink.into(),
            command: command.into(),
            node: node.into(),
            transport: TransportSettings::default(),
        }
    }

    pub fn with_transport(mut self, transport: TransportSettings) -> Self {
        self.transport = transport;
        self
    }

    /// Spawner for the currently running executable.
    pub fn current_exe(
        streamer: impl Into<String>,
        sink: impl Into<String>,
        command: impl Into<String>,
        node: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, streamer, sink, command, node))
    }
}

impl ProcessSpawner {
    fn command(&self, slot: usize) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .arg("--streamer")
            .arg(&self.streamer)
            .arg("--sink")
            .arg(&self.sink)
            .arg("--command")
            .arg(&self.command)
            .arg("--node")
            .arg(&self.node)
            .arg("--max-frame-bytes")
            .arg(self.transport.max_frame_bytes.to_string())
            .arg("--connect-timeout-ms")
            .arg(self.transport.connect_timeout.as_millis().to_string())
            .arg("--request-timeout-ms")
            .arg(self.transport.request_timeout.as_millis().to_string())
            .env("PLN_WORKER_SLOT", slot.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, slot: usize) -> Result<Child> {
        Ok(self.command(slot).spawn()?)
    }
}

/// Live counters shared between the supervisor and the heartbeat.
#[derive(Debug, Default)]
pub struct SupervisorStatus {
    capacity: usize,
    running: AtomicUsize,
    failed_workers: AtomicUsize,
    restarts: AtomicU64,
}

impl SupervisorStatus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }

    /// Slots abandoned after exhausting their restart budget.
    pub fn failed_workers(&self) -> usize {
        self.failed_workers.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> NodeHealth {
        NodeHealth {
            load: self.running(),
            capacity: Some(self.capacity),
            failed_workers: self.failed_workers(),
        }
    }
}

/// Bounded restart policy with exponential backoff and jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive failures tolerated before a slot is abandoned.
    pub max_restarts: u32,
    pub backoff: Duration,
    /// Upper bound on the delay; a worker that ran at least this long
    /// resets its slot's failure count.
    pub backoff_max: Duration,
}

impl RestartPolicy {
    pub fn from_settings(settings: &DriverSettings) -> Self {
        Self {
            max_restarts: settings.max_restarts,
            backoff: settings.restart_backoff,
            backoff_max: settings.restart_backoff_max,
        }
    }

    /// Delay before restart number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .backoff
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max);
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.backoff_max)
    }
}

/// Keeps `worker_count` workers running until cancelled.
pub struct Supervisor {
    worker_count: usize,
    policy: RestartPolicy,
    spawner: Arc<dyn WorkerSpawner>,
    status: Arc<SupervisorStatus>,
}

impl Supervisor {
    pub fn new(
        worker_count: usize,
        policy: RestartPolicy,
        spawner: Arc<dyn WorkerSpawner>,
        status: Arc<SupervisorStatus>,
    ) -> Self {
        Self {
            worker_count,
            policy,
            spawner,
            status,
        }
    }

    pub fn status(&self) -> Arc<SupervisorStatus> {
        self.status.clone()
    }

    /// Run every slot until cancelled or abandoned. On cancellation all
    /// workers are killed and reaped before this returns.
    pub async fn run(self, token: CancellationToken) {
        let mut slots = JoinSet::new();
        for slot in 0..self.worker_count {
            slots.spawn(supervise_slot(
                slot,
                self.policy,
                self.spawner.clone(),
                self.status.clone(),
                token.clone(),
            ));
        }
        tracing::info!(workers = self.worker_count, "Supervising workers");

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Supervision slot panicked");
            }
        }

        if !token.is_cancelled() {
            tracing::error!("Every worker slot was abandoned");
        }
    }
}

async fn supervise_slot(
    slot: usize,
    policy: RestartPolicy,
    spawner: Arc<dyn WorkerSpawner>,
    status: Arc<SupervisorStatus>,
    token: CancellationToken,
) {
    let mut failures = 0u32;

    loop {
        let started = Instant::now();
        let exit = match spawner.spawn(slot) {
            Ok(child) => {
                status.running.fetch_add(1, Ordering::Relaxed);
                let exit = watch_child(slot, child, &token).await;
                status.running.fetch_sub(1, Ordering::Relaxed);
                match exit {
                    Some(exit) => exit,
                    None => return,
                }
            }
            Err(e) => format!("spawn failed: {}", e),
        };

        if token.is_cancelled() {
            return;
        }

        if started.elapsed() >= policy.backoff_max {
            failures = 0;
        }
        failures += 1;

        if failures > policy.max_restarts {
            status.failed_workers.fetch_add(1, Ordering::Relaxed);
            tracing::error!(slot, failures, exit = %exit, "Worker restart budget exhausted, slot abandoned");
            return;
        }

        let delay = policy.delay(failures);
        tracing::warn!(
            slot,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            exit = %exit,
            "Worker exited unexpectedly, restarting"
        );

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        status.restarts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Wait for a worker to exit. Returns `None` if cancelled first, in which
/// case the worker has been killed and reaped.
async fn watch_child(slot: usize, mut child: Child, token: &CancellationToken) -> Option<String> {
    tokio::select! {
        _ = token.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(slot, error = %e, "Failed to stop worker");
            }
            None
        }
        exit = child.wait() => Some(match exit {
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        }),
    }
}
