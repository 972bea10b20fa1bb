use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, Result};
use crate::manager::actor::CoreHandle;

const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a provisioner needs to know to start a SlaveDriver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionContext {
    /// Configuration endpoint the SlaveDriver must contact, `tcp://host:port`.
    pub manager_endpoint: String,
}

/// Starts SlaveDrivers on cluster nodes during bootstrap.
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Make sure a SlaveDriver is running on `node_id`. Returning does not
    /// mean it has contacted the Manager yet.
    async fn ensure_node_running(&self, node_id: &str, ctx: &ProvisionContext) -> Result<()>;
}

/// Provisioner for topologies managed outside the Manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProvisioner;

#[async_trait]
impl ClusterProvisioner for NoopProvisioner {
    async fn ensure_node_running(&self, node_id: &str, _ctx: &ProvisionContext) -> Result<()> {
        tracing::debug!(node = node_id, "Assuming SlaveDriver is managed externally");
        Ok(())
    }
}

/// Runs a shell command template for each node.
///
/// `{node}` and `{manager}` in the template are replaced with the node id
/// and the Manager's configuration endpoint, e.g.
/// `ssh {node} pln-cluster slavedriver {manager}`.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    template: String,
}

impl CommandProvisioner {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn render(&self, node_id: &str, ctx: &ProvisionContext) -> String {
        self.template
            .replace("{node}", node_id)
            .replace("{manager}", &ctx.manager_endpoint)
    }
}

#[async_trait]
impl ClusterProvisioner for CommandProvisioner {
    async fn ensure_node_running(&self, node_id: &str, ctx: &ProvisionContext) -> Result<()> {
        let command = self.render(node_id, ctx);
        tracing::info!(node = node_id, command = %command, "Launching SlaveDriver");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| ClusterError::Provision {
                node: node_id.to_string(),
                reason: e.to_string(),
            })?;

        // The launcher may run for the lifetime of the SlaveDriver (ssh).
        let node = node_id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::debug!(node = %node, "Launcher exited");
                }
                Ok(status) => {
                    tracing::warn!(node = %node, code = ?status.code(), "Launcher exited with failure");
                }
                Err(e) => {
                    tracing::warn!(node = %node, error = %e, "Failed to wait for launcher");
                }
            }
        });

        Ok(())
    }
}

/// Provision every node, then wait until each has fetched its configuration.
///
/// Fails if a provisioner errors, the timeout expires first, or the token is
/// cancelled.
pub async fn bootstrap(
    nodes: &[String],
    provisioner: &dyn ClusterProvisioner,
    ctx: &ProvisionContext,
    core: &CoreHandle,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<()> {
    for node in nodes {
        provisioner.ensure_node_running(node, ctx).await?;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let pending = core.pending_nodes(nodes.to_vec()).await?;
        if pending.is_empty() {
            tracing::info!(nodes = nodes.len(), "All nodes fetched configuration");
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(ClusterError::Bootstrap(format!(
                "timed out after {:?} waiting for {}",
                timeout,
                pending.join(", ")
            )));
        }

        tokio::select! {
            _ = token.cancelled() => return Err(ClusterError::ShuttingDown),
            _ = tokio::time::sleep(PENDING_POLL_INTERVAL) => {}
        }
    }
}
