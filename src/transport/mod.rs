//! Message transport shared by the Manager, SlaveDrivers and workers.
//!
//! Every endpoint is a TCP socket carrying length-delimited frames whose
//! bodies are JSON documents. Two patterns are built on top:
//!
//! - **request/reply**: the client writes one frame and waits for exactly one
//!   reply frame ([`RequestClient`]).
//! - **push/pull**: one side only writes frames ([`Pusher`]), the other only
//!   reads them ([`Puller`]).
//!
//! Addresses are written `tcp://host:port` or `host:port`.

pub mod client;

pub use client::{Puller, Pusher, RequestClient};

use bytes::Bytes;
use futures::SinkExt;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::config::TransportSettings;
use crate::error::{ClusterError, Result};

pub type FramedConn = Framed<TcpStream, LengthDelimitedCodec>;

const SCHEME: &str = "tcp://";

pub fn codec(settings: &TransportSettings) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(settings.max_frame_bytes)
        .new_codec()
}

pub fn framed(stream: TcpStream, settings: &TransportSettings) -> FramedConn {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    Framed::new(stream, codec(settings))
}

/// Normalize an endpoint address to `host:port`.
pub fn parse_endpoint(addr: &str) -> Result<String> {
    let trimmed = addr.trim();
    let bare = trimmed.strip_prefix(SCHEME).unwrap_or(trimmed);

    let (host, port) = bare
        .rsplit_once(':')
        .ok_or_else(|| ClusterError::InvalidEndpoint(addr.to_string()))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(ClusterError::InvalidEndpoint(addr.to_string()));
    }
    Ok(format!("{}:{}", host, port))
}

/// Host part of an endpoint address.
pub fn endpoint_host(addr: &str) -> Result<String> {
    let normalized = parse_endpoint(addr)?;
    normalized
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .ok_or_else(|| ClusterError::InvalidEndpoint(addr.to_string()))
}

/// Open a framed connection, bounded by the connect timeout.
pub async fn connect(endpoint: &str, settings: &TransportSettings) -> Result<FramedConn> {
    let addr = parse_endpoint(endpoint)?;
    match tokio::time::timeout(settings.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => Ok(framed(stream, settings)),
        Ok(Err(e)) => Err(ClusterError::ConnectionFailed {
            endpoint: addr,
            reason: e.to_string(),
        }),
        Err(_) => Err(ClusterError::Timeout {
            what: format!("connecting to {}", addr),
        }),
    }
}

/// True if a read failed because the peer announced a frame over the limit.
pub fn is_oversized_frame(error: &std::io::Error) -> bool {
    error
        .get_ref()
        .map_or(false, |inner| inner.is::<LengthDelimitedCodecError>())
}

pub async fn send_json<T: Serialize + ?Sized>(conn: &mut FramedConn, message: &T) -> Result<()> {
    let body = serde_json::to_vec(message)?;
    conn.send(Bytes::from(body)).await?;
    Ok(())
}
