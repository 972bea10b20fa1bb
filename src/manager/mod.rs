//! The Manager: single authoritative coordinator of the cluster.
//!
//! # Components
//!
//! - [`actor::ManagerCore`]: owns the job queue and cluster state and serves
//!   every request from one loop
//! - [`endpoints`]: listener tasks for intake, status, control, streamer and
//!   sink sockets
//! - [`bootstrap`]: provisioning of the declared topology before serving
//! - [`protocol`]: wire messages
//!
//! # Startup
//!
//! 1. The configuration is validated (see [`ManagerConfig::from_document`])
//! 2. The control endpoint is bound and the serving loop spawned
//! 3. In bootstrap mode, every node in `cluster.nodes` is provisioned and
//!    the Manager waits until each has fetched its localconf
//! 4. Intake, status, streamer and sink endpoints (and the dashboard) are
//!    bound and the Manager enters [`ManagerPhase::Serving`]

pub mod actor;
pub mod bootstrap;
pub mod endpoints;
pub mod protocol;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::dashboard::run_dashboard;
use crate::error::{ClusterError, Result};

pub use self::actor::{CoreHandle, ManagerCore};
pub use self::bootstrap::{ClusterProvisioner, CommandProvisioner, NoopProvisioner, ProvisionContext};
pub use self::endpoints::ReplyEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    Initializing,
    Bootstrapping,
    Serving,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for ManagerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerPhase::Initializing => write!(f, "initializing"),
            ManagerPhase::Bootstrapping => write!(f, "bootstrapping"),
            ManagerPhase::Serving => write!(f, "serving"),
            ManagerPhase::ShuttingDown => write!(f, "shutting down"),
            ManagerPhase::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupMode {
    /// Provision the declared topology before serving.
    #[default]
    Bootstrap,
    /// The topology is managed externally.
    NoSetup,
}

/// Addresses the Manager actually listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundEndpoints {
    pub control: SocketAddr,
    pub intake: SocketAddr,
    pub status: SocketAddr,
    pub streamer: SocketAddr,
    pub sink: SocketAddr,
    pub dashboard: Option<SocketAddr>,
}

pub struct Manager {
    config: ManagerConfig,
    mode: StartupMode,
    provisioner: Arc<dyn ClusterProvisioner>,
}

impl Manager {
    /// The provisioner defaults to running `cluster.launch` when set.
    pub fn new(config: ManagerConfig, mode: StartupMode) -> Self {
        let provisioner: Arc<dyn ClusterProvisioner> = match &config.launch_command {
            Some(template) => Arc::new(CommandProvisioner::new(template.clone())),
            None => Arc::new(NoopProvisioner),
        };
        Self {
            config,
            mode,
            provisioner,
        }
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn ClusterProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Bring the Manager up to [`ManagerPhase::Serving`].
    ///
    /// Cancelling `token` (or calling [`ManagerHandle::shutdown`]) stops every
    /// endpoint and the serving loop. If startup fails, everything already
    /// started is torn down before the error is returned.
    pub async fn start(self, token: CancellationToken) -> Result<ManagerHandle> {
        let token = token.child_token();
        let (phase_tx, phase_rx) = watch::channel(ManagerPhase::Initializing);
        let mut tasks = JoinSet::new();

        match self.start_tasks(&mut tasks, &phase_tx, &token).await {
            Ok((endpoints, core)) => {
                let _ = phase_tx.send(ManagerPhase::Serving);
                tracing::info!(
                    intake = %endpoints.intake,
                    status = %endpoints.status,
                    control = %endpoints.control,
                    streamer = %endpoints.streamer,
                    sink = %endpoints.sink,
                    "Manager serving"
                );

                let supervisor = tokio::spawn(supervise(tasks, phase_tx, token.clone()));
                Ok(ManagerHandle {
                    endpoints,
                    core,
                    phase_rx,
                    token,
                    supervisor,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "Manager startup failed");
                token.cancel();
                while tasks.join_next().await.is_some() {}
                let _ = phase_tx.send(ManagerPhase::Stopped);
                Err(e)
            }
        }
    }

    async fn start_tasks(
        &self,
        tasks: &mut JoinSet<()>,
        phase_tx: &watch::Sender<ManagerPhase>,
        token: &CancellationToken,
    ) -> Result<(BoundEndpoints, CoreHandle)> {
        let config = &self.config;
        let transport = config.transport;

        let control_listener = bind(&config.bind_host, config.conf_port).await?;
        let control = control_listener.local_addr()?;

        let (core, requests) = CoreHandle::channel();
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.streamer_hwm);
        tasks.spawn(ManagerCore::new(config).run(
            requests,
            dispatch_tx,
            config.sweep_interval,
            token.clone(),
        ));
        tasks.spawn(endpoints::serve_replies(
            ReplyEndpoint::Control,
            control_listener,
            core.clone(),
            transport,
            token.clone(),
        ));

        if self.mode == StartupMode::Bootstrap {
            let _ = phase_tx.send(ManagerPhase::Bootstrapping);
            let nodes = config.document.node_ids();
            let ctx = ProvisionContext {
                manager_endpoint: format!("tcp://{}:{}", advertised_host(config, control), control.port()),
            };
            tracing::info!(nodes = nodes.len(), manager = %ctx.manager_endpoint, "Bootstrapping cluster");
            bootstrap::bootstrap(
                &nodes,
                self.provisioner.as_ref(),
                &ctx,
                &core,
                config.bootstrap_timeout,
                token,
            )
            .await?;
        }

        let intake_listener = bind(&config.bind_host, config.reply_port).await?;
        let status_listener = bind(&config.bind_host, config.status_port).await?;
        let streamer_listener = bind(&config.bind_host, config.streamer_port).await?;
        let sink_listener = bind(&config.bind_host, config.sink_port).await?;
        let dashboard_listener = match config.dashboard_port {
            Some(port) => Some(bind(&config.bind_host, port).await?),
            None => None,
        };

        let endpoints = BoundEndpoints {
            control,
            intake: intake_listener.local_addr()?,
            status: status_listener.local_addr()?,
            streamer: streamer_listener.local_addr()?,
            sink: sink_listener.local_addr()?,
            dashboard: match &dashboard_listener {
                Some(listener) => Some(listener.local_addr()?),
                None => None,
            },
        };

        tasks.spawn(endpoints::serve_replies(
            ReplyEndpoint::Intake,
            intake_listener,
            core.clone(),
            transport,
            token.clone(),
        ));
        tasks.spawn(endpoints::serve_replies(
            ReplyEndpoint::Status,
            status_listener,
            core.clone(),
            transport,
            token.clone(),
        ));
        tasks.spawn(endpoints::serve_stream(
            streamer_listener,
            dispatch_rx,
            core.clone(),
            transport,
            token.clone(),
        ));
        tasks.spawn(endpoints::serve_sink(
            sink_listener,
            core.clone(),
            transport,
            token.clone(),
        ));
        if let Some(listener) = dashboard_listener {
            tasks.spawn(run_dashboard(listener, core.clone(), token.clone()));
        }

        Ok((endpoints, core))
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port)).await.map_err(|e| {
        tracing::error!(host, port, error = %e, "Failed to bind endpoint");
        ClusterError::Io(e)
    })
}

/// Host placed in the endpoint handed to provisioned SlaveDrivers.
fn advertised_host(config: &ManagerConfig, control: SocketAddr) -> String {
    if let Some(host) = &config.advertise_host {
        return host.clone();
    }
    match control.ip() {
        ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST).to_string(),
        ip => ip.to_string(),
    }
}

async fn supervise(
    mut tasks: JoinSet<()>,
    phase_tx: watch::Sender<ManagerPhase>,
    token: CancellationToken,
) {
    // Every task runs until cancellation, so an early exit is a failure.
    tokio::select! {
        _ = token.cancelled() => {}
        Some(joined) = tasks.join_next() => {
            match joined {
                Ok(()) => tracing::error!("Manager task exited unexpectedly"),
                Err(e) => tracing::error!(error = %e, "Manager task failed"),
            }
            token.cancel();
        }
    }
    let _ = phase_tx.send(ManagerPhase::ShuttingDown);
    tracing::info!("Manager shutting down");

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Manager task failed");
        }
    }

    let _ = phase_tx.send(ManagerPhase::Stopped);
    tracing::info!("Manager stopped");
}

/// A running Manager.
pub struct ManagerHandle {
    endpoints: BoundEndpoints,
    core: CoreHandle,
    phase_rx: watch::Receiver<ManagerPhase>,
    token: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl ManagerHandle {
    pub fn endpoints(&self) -> &BoundEndpoints {
        &self.endpoints
    }

    pub fn core(&self) -> &CoreHandle {
        &self.core
    }

    pub fn phase(&self) -> ManagerPhase {
        *self.phase_rx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ManagerPhase> {
        self.phase_rx.clone()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Wait until every endpoint and the serving loop have stopped.
    pub async fn wait(self) -> Result<()> {
        self.supervisor
            .await
            .map_err(|e| ClusterError::Internal(format!("manager supervisor failed: {}", e)))
    }
}

/// Start a Manager and serve until `token` is cancelled.
pub async fn run_manager(
    config: ManagerConfig,
    mode: StartupMode,
    token: CancellationToken,
) -> Result<()> {
    let handle = Manager::new(config, mode).start(token).await?;
    handle.wait().await
}
