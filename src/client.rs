//! One-shot helpers for talking to a running Manager.

use bytes::Bytes;
use serde::Serialize;

use crate::config::TransportSettings;
use crate::error::Result;
use crate::manager::protocol::{Ack, StatusReply, STATUS_REQUEST};
use crate::transport::RequestClient;

/// Submit a job description (object) or batch (array) to the intake endpoint.
pub async fn submit<T: Serialize + ?Sized>(
    addr: &str,
    jobs: &T,
    transport: TransportSettings,
) -> Result<Ack> {
    let mut client = RequestClient::connect(addr, transport).await?;
    client.request(jobs).await
}

/// Query the status endpoint.
pub async fn status(addr: &str, transport: TransportSettings) -> Result<StatusReply> {
    let mut client = RequestClient::connect(addr, transport).await?;
    let reply = client
        .request_bytes(Bytes::from_static(STATUS_REQUEST))
        .await?;
    Ok(serde_json::from_slice(&reply)?)
}
