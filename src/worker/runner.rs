use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::TransportSettings;
use crate::error::{ClusterError, Result};
use crate::manager::protocol::{SinkMessage, StreamedJob};
use crate::transport::{Puller, Pusher};
use crate::worker::executor::JobProcessor;

/// Where a worker pulls jobs from and pushes results to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoints {
    pub streamer: String,
    pub sink: String,
}

/// Pull jobs from the streamer, process them and push results to the sink.
///
/// Returns `Ok(())` when cancelled or when the Manager closes the stream. A
/// job already being processed when the token is cancelled is finished and
/// its result pushed first.
pub async fn run_worker(
    endpoints: &WorkerEndpoints,
    processor: Arc<dyn JobProcessor>,
    node: Option<String>,
    transport: TransportSettings,
    token: CancellationToken,
) -> Result<()> {
    let mut puller = Puller::connect(&endpoints.streamer, transport).await?;
    let mut pusher = Pusher::connect(&endpoints.sink, transport).await?;
    tracing::info!(streamer = %endpoints.streamer, sink = %endpoints.sink, "Worker connected");

    let mut processed = 0u64;
    loop {
        let pulled = tokio::select! {
            _ = token.cancelled() => break,
            pulled = puller.pull::<StreamedJob>() => pulled,
        };

        let job = match pulled {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::info!("Streamer closed the connection");
                break;
            }
            Err(ClusterError::Json(e)) => {
                tracing::warn!(error = %e, "Skipping malformed job");
                continue;
            }
            Err(e) => return Err(e),
        };

        let outcome = processor.process(&job).await;
        let message = SinkMessage {
            jobid: job.jobid,
            status: outcome.status,
            result: outcome.result,
            error: outcome.error,
            node: node.clone(),
        };
        pusher.push(&message).await?;
        processed += 1;
    }

    tracing::info!(processed, "Worker stopped");
    Ok(())
}
