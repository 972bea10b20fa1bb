//! The SlaveDriver: per-node agent between the Manager and local workers.
//!
//! # Lifecycle
//!
//! 1. **FetchingConfig**: [`SlaveDriver::fetch`] sends the node identity to
//!    the Manager's configuration endpoint and waits for its `localconf`.
//!    Any failure here is fatal.
//! 2. **Supervising**: [`SlaveDriver::run`] keeps `worker.count` workers
//!    running (see [`supervisor`]) and sends heartbeats (see [`heartbeat`]).
//! 3. **ShuttingDown**: on cancellation every worker is killed and reaped and
//!    the control connection is closed.

pub mod heartbeat;
pub mod supervisor;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{DriverSettings, LocalConf, TransportSettings};
use crate::error::{ClusterError, Result};
use crate::manager::protocol::{ControlReply, ControlRequest};
use crate::transport::{endpoint_host, parse_endpoint, RequestClient};
use crate::worker::WorkerEndpoints;

pub use heartbeat::HeartbeatSender;
pub use supervisor::{ProcessSpawner, RestartPolicy, Supervisor, SupervisorStatus, WorkerSpawner};

/// A configured SlaveDriver, ready to supervise workers.
pub struct SlaveDriver {
    identity: String,
    manager: String,
    localconf: LocalConf,
    settings: DriverSettings,
    control: RequestClient,
}

impl std::fmt::Debug for SlaveDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveDriver")
            .field("identity", &self.identity)
            .field("manager", &self.manager)
            .field("settings", &self.settings)
            .finish()
    }
}

impl SlaveDriver {
    /// Fetch this node's configuration from the Manager.
    ///
    /// Without an explicit `identity` the node is identified by the local IP
    /// address of the connection to the Manager.
    pub async fn fetch(
        manager: &str,
        identity: Option<String>,
        transport: TransportSettings,
    ) -> Result<Self> {
        let manager = parse_endpoint(manager)?;
        let mut control = RequestClient::connect(&manager, transport).await?;
        let identity = match identity {
            Some(identity) => identity,
            None => control.local_addr()?.ip().to_string(),
        };

        tracing::info!(node = %identity, manager = %manager, "Fetching node configuration");
        let reply: ControlReply = control
            .request(&ControlRequest::Identity(identity.clone()))
            .await?;

        let localconf = match reply {
            ControlReply::Conf(conf) => conf.localconf,
            ControlReply::Ack(ack) => {
                return Err(ClusterError::Rejected(
                    ack.reason.unwrap_or(ack.ans),
                ))
            }
        };
        let settings = DriverSettings::from_localconf(&localconf)?;
        tracing::info!(
            node = %identity,
            workers = settings.worker_count,
            command = %settings.worker_command,
            "Configuration received"
        );

        Ok(Self {
            identity,
            manager,
            localconf,
            settings,
            control,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn localconf(&self) -> &LocalConf {
        &self.localconf
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Streaming and sink endpoints on the Manager's host.
    pub fn worker_endpoints(&self) -> Result<WorkerEndpoints> {
        let host = endpoint_host(&self.manager)?;
        Ok(WorkerEndpoints {
            streamer: format!("{}:{}", host, self.settings.streamer_port),
            sink: format!("{}:{}", host, self.settings.sink_port),
        })
    }

    /// Spawner that runs this binary's `worker` subcommand with this node's
    /// endpoints, processor command and transport settings.
    pub fn process_spawner(&self) -> Result<ProcessSpawner> {
        let endpoints = self.worker_endpoints()?;
        Ok(ProcessSpawner::current_exe(
            endpoints.streamer,
            endpoints.sink,
            self.settings.worker_command.clone(),
            self.identity.clone(),
        )?
        .with_transport(self.settings.transport))
    }

    /// Supervise workers and send heartbeats until cancelled.
    pub async fn run(self, spawner: Arc<dyn WorkerSpawner>, token: CancellationToken) -> Result<()> {
        let status = Arc::new(SupervisorStatus::new(self.settings.worker_count));
        let supervisor = Supervisor::new(
            self.settings.worker_count,
            RestartPolicy::from_settings(&self.settings),
            spawner,
            status.clone(),
        );
        let heartbeat = HeartbeatSender::new(
            self.settings.heartbeat_interval,
            self.identity.clone(),
            self.manager.clone(),
            self.settings.transport,
        );

        tracing::info!(node = %self.identity, "Supervising");
        let heartbeat_token = token.clone();
        let heartbeat_status = status.clone();
        let control = self.control;
        let heartbeat_task = tokio::spawn(async move {
            heartbeat.run(Some(control), heartbeat_status, heartbeat_token).await;
        });

        supervisor.run(token.clone()).await;

        // Keep reporting (with failed_workers) even if every slot gave up.
        token.cancelled().await;
        tracing::info!(node = %self.identity, "SlaveDriver shutting down");

        heartbeat_task
            .await
            .map_err(|e| ClusterError::Internal(format!("heartbeat task failed: {}", e)))?;
        tracing::info!(
            node = %self.identity,
            restarts = status.restarts(),
            failed_workers = status.failed_workers(),
            "SlaveDriver stopped"
        );
        Ok(())
    }
}
