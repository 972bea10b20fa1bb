use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::TransportSettings;
use crate::error::{ClusterError, Result};
use crate::manager::protocol::{ControlReply, ControlRequest, Heartbeat};
use crate::slavedriver::supervisor::SupervisorStatus;
use crate::transport::RequestClient;

/// Periodically reports node health to the Manager's control endpoint.
pub struct HeartbeatSender {
    interval: Duration,
    node: String,
    manager: String,
    transport: TransportSettings,
}

impl HeartbeatSender {
    pub fn new(
        interval: Duration,
        node: impl Into<String>,
        manager: impl Into<String>,
        transport: TransportSettings,
    ) -> Self {
        Self {
            interval,
            node: node.into(),
            manager: manager.into(),
            transport,
        }
    }

    /// Send heartbeats until cancelled.
    ///
    /// `client` is reused while it works; after a failure the next tick opens
    /// a fresh connection. The connection is closed on return.
    pub async fn run(
        &self,
        mut client: Option<RequestClient>,
        status: Arc<SupervisorStatus>,
        token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let request = ControlRequest::Heartbeat {
                heartbeat: Heartbeat {
                    node: self.node.clone(),
                    health: status.health(),
                },
            };

            match self.send(&mut client, &request).await {
                Ok(()) => tracing::trace!(node = %self.node, "Heartbeat sent"),
                Err(e) => tracing::warn!(node = %self.node, error = %e, "Heartbeat failed"),
            }
        }

        tracing::debug!(node = %self.node, "Heartbeat stopped");
    }

    /// One heartbeat exchange. The connection is only kept on success.
    async fn send(&self, client: &mut Option<RequestClient>, request: &ControlRequest) -> Result<()> {
        let mut conn = match client.take() {
            Some(conn) => conn,
            None => RequestClient::connect(&self.manager, self.transport).await?,
        };

        match conn.request::<_, ControlReply>(request).await? {
            ControlReply::Ack(ack) if ack.is_error() => Err(ClusterError::Rejected(
                ack.reason.unwrap_or_else(|| "heartbeat rejected".to_string()),
            )),
            _ => {
                *client = Some(conn);
                Ok(())
            }
        }
    }
}
