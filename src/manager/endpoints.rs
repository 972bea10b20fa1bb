//! Socket-facing tasks of the Manager.
//!
//! Each endpoint owns its listener and spawns one task per connection. None
//! of them touch Manager state directly; everything goes through the
//! [`CoreHandle`].

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::TransportSettings;
use crate::error::Result;
use crate::manager::actor::{CoreHandle, Dispatch};
use crate::manager::protocol::{Ack, SinkMessage};
use crate::transport::{framed, is_oversized_frame, send_json, FramedConn};

/// The request/reply endpoints served by the Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyEndpoint {
    /// Job intake.
    Intake,
    /// Cluster and job status.
    Status,
    /// Configuration distribution and heartbeats.
    Control,
}

impl ReplyEndpoint {
    pub fn name(self) -> &'static str {
        match self {
            ReplyEndpoint::Intake => "intake",
            ReplyEndpoint::Status => "status",
            ReplyEndpoint::Control => "control",
        }
    }

    async fn answer(self, core: &CoreHandle, body: Bytes) -> Result<Bytes> {
        let reply = match self {
            ReplyEndpoint::Intake => serde_json::to_vec(&core.submit(body).await?)?,
            ReplyEndpoint::Status => serde_json::to_vec(&core.status().await?)?,
            ReplyEndpoint::Control => serde_json::to_vec(&core.control(body).await?)?,
        };
        Ok(Bytes::from(reply))
    }
}

/// Accept connections until cancelled, running `serve` for each one.
async fn accept_loop<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    settings: TransportSettings,
    token: CancellationToken,
    serve: F,
) where
    F: Fn(FramedConn, CancellationToken) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(endpoint = name, peer = %peer, "Connection accepted");
                    connections.spawn(serve(framed(stream, &settings), token.child_token()));
                }
                Err(e) => {
                    tracing::warn!(endpoint = name, error = %e, "Accept failed");
                }
            },

            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
    tracing::debug!(endpoint = name, "Endpoint closed");
}

/// Serve a request/reply endpoint: one reply frame per request frame.
pub async fn serve_replies(
    endpoint: ReplyEndpoint,
    listener: TcpListener,
    core: CoreHandle,
    settings: TransportSettings,
    token: CancellationToken,
) {
    accept_loop(endpoint.name(), listener, settings, token, move |conn, token| {
        reply_connection(endpoint, conn, core.clone(), settings, token)
    })
    .await;
}

async fn reply_connection(
    endpoint: ReplyEndpoint,
    mut conn: FramedConn,
    core: CoreHandle,
    settings: TransportSettings,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = conn.next() => frame,
        };

        let body = match frame {
            Some(Ok(body)) => body.freeze(),
            Some(Err(e)) if is_oversized_frame(&e) => {
                tracing::warn!(endpoint = endpoint.name(), error = %e, "Rejecting oversized request");
                reject_oversized(endpoint, &mut conn, &settings, &token).await;
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(endpoint = endpoint.name(), error = %e, "Dropping connection after bad frame");
                break;
            }
            None => break,
        };

        let reply = match endpoint.answer(&core, body).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(endpoint = endpoint.name(), error = %e, "Request not answered");
                break;
            }
        };

        if let Err(e) = conn.send(reply).await {
            tracing::debug!(endpoint = endpoint.name(), error = %e, "Failed to write reply");
            break;
        }
    }
}

/// Answer an oversized request with an error ack, then discard what the peer
/// is still sending so the reply is not lost to a connection reset.
async fn reject_oversized(
    endpoint: ReplyEndpoint,
    conn: &mut FramedConn,
    settings: &TransportSettings,
    token: &CancellationToken,
) {
    let reason = match endpoint {
        ReplyEndpoint::Intake => "submission exceeds max_frame_bytes",
        _ => "request exceeds max_frame_bytes",
    };
    if let Err(e) = send_json(conn, &Ack::error(reason)).await {
        tracing::debug!(endpoint = endpoint.name(), error = %e, "Failed to write rejection");
        return;
    }

    let stream = conn.get_mut();
    let drain = async {
        let mut buf = [0u8; 8192];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    };
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::timeout(settings.request_timeout, drain) => {}
    }
}

/// Serve the work-streaming endpoint.
///
/// Connected pullers compete for the dispatch channel, so each job goes to
/// exactly one of them. A job whose write fails is handed back to the core
/// for re-queueing.
pub async fn serve_stream(
    listener: TcpListener,
    dispatch_rx: mpsc::Receiver<Dispatch>,
    core: CoreHandle,
    settings: TransportSettings,
    token: CancellationToken,
) {
    let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));
    accept_loop("streamer", listener, settings, token, move |conn, token| {
        stream_connection(conn, dispatch_rx.clone(), core.clone(), token)
    })
    .await;
}

async fn stream_connection(
    mut conn: FramedConn,
    dispatch_rx: Arc<Mutex<mpsc::Receiver<Dispatch>>>,
    core: CoreHandle,
    token: CancellationToken,
) {
    loop {
        let dispatch = tokio::select! {
            _ = token.cancelled() => break,

            // Pullers never write; a read only completes on disconnect.
            incoming = conn.next() => match incoming {
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            },

            dispatch = async { dispatch_rx.lock().await.recv().await } => match dispatch {
                Some(dispatch) => dispatch,
                None => break,
            },
        };

        if let Err(e) = send_json(&mut conn, &dispatch.message).await {
            tracing::warn!(seq = dispatch.seq, error = %e, "Puller went away, re-queueing job");
            let _ = core.requeue(dispatch.seq).await;
            break;
        }
    }
    tracing::debug!("Puller disconnected");
}

/// Serve the result sink: workers push [`SinkMessage`]s, nothing is replied.
pub async fn serve_sink(
    listener: TcpListener,
    core: CoreHandle,
    settings: TransportSettings,
    token: CancellationToken,
) {
    accept_loop("sink", listener, settings, token, move |conn, token| {
        sink_connection(conn, core.clone(), token)
    })
    .await;
}

async fn sink_connection(mut conn: FramedConn, core: CoreHandle, token: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = conn.next() => frame,
        };

        let body = match frame {
            Some(Ok(body)) => body,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Dropping sink connection after bad frame");
                break;
            }
            None => break,
        };

        match serde_json::from_slice::<SinkMessage>(&body) {
            Ok(message) => {
                if core.result(message).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed result"),
        }
    }
}
