use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::TransportSettings;
use crate::error::{ClusterError, Result};
use crate::transport::{connect, parse_endpoint, send_json, FramedConn};

/// Client side of a request/reply endpoint.
///
/// After a timed-out request the connection is out of step with the server;
/// drop the client and connect again.
pub struct RequestClient {
    endpoint: String,
    conn: FramedConn,
    settings: TransportSettings,
}

impl RequestClient {
    pub async fn connect(endpoint: &str, settings: TransportSettings) -> Result<Self> {
        let conn = connect(endpoint, &settings).await?;
        Ok(Self {
            endpoint: parse_endpoint(endpoint)?,
            conn,
            settings,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Local address of the underlying connection.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.conn.get_ref().local_addr()?)
    }

    /// Send a raw frame and wait for the reply frame.
    pub async fn request_bytes(&mut self, body: Bytes) -> Result<Bytes> {
        let request_timeout = self.settings.request_timeout;
        match tokio::time::timeout(request_timeout, self.exchange(body)).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout {
                what: format!("waiting for reply from {}", self.endpoint),
            }),
        }
    }

    async fn exchange(&mut self, body: Bytes) -> Result<Bytes> {
        self.conn.send(body).await?;
        match self.conn.next().await {
            Some(frame) => Ok(frame?.freeze()),
            None => Err(ClusterError::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                reason: "connection closed before reply".to_string(),
            }),
        }
    }

    /// Send a JSON request and decode the JSON reply.
    pub async fn request<T, R>(&mut self, message: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_vec(message)?;
        let reply = self.request_bytes(Bytes::from(body)).await?;
        Ok(serde_json::from_slice(&reply)?)
    }
}

/// Write-only end of a push/pull channel.
pub struct Pusher {
    conn: FramedConn,
}

impl Pusher {
    pub async fn connect(endpoint: &str, settings: TransportSettings) -> Result<Self> {
        Ok(Self {
            conn: connect(endpoint, &settings).await?,
        })
    }

    pub async fn push<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        send_json(&mut self.conn, message).await
    }
}

/// Read-only end of a push/pull channel.
pub struct Puller {
    conn: FramedConn,
}

impl Puller {
    pub async fn connect(endpoint: &str, settings: TransportSettings) -> Result<Self> {
        Ok(Self {
            conn: connect(endpoint, &settings).await?,
        })
    }

    /// Next message, or `None` once the pushing side closes the connection.
    pub async fn pull<R: DeserializeOwned>(&mut self) -> Result<Option<R>> {
        match self.conn.next().await {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame?)?)),
            None => Ok(None),
        }
    }
}
