//! Bidirectional upload with per-chunk progress notices.
//!
//! Two tasks share the call:
//!
//! ```text
//!  request stream ──> ingest ──(cumulative bytes)──> notify ──> response stream
//!                       │                               │
//!                       └──────────> supervisor <───────┘
//!                                        │
//!                                   completion
//! ```
//!
//! `ingest` never waits for the peer to read a notice, only for room in the
//! bounded hand-off queue. `notify` emits exactly one notice per chunk in
//! ingest order. The supervisor waits for both, commits the blob if neither
//! failed, reports any failure on the response stream, then closes it and
//! fires the completion signal.

use std::sync::Arc;

use ferry::{Reassembler, TransferConfig, TransferError, TransferResult, TransferStore};
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;

use super::TargetName;
use crate::channel::{self, Inbound, Outbound, ResponseSink};
use crate::proto::{UploadAndNotifyProgressRequest, UploadAndNotifyProgressResponse};
use crate::status::to_status;

/// Build the notice sent after `received_bytes` have been ingested.
pub fn progress_notice(received_bytes: u64) -> UploadAndNotifyProgressResponse {
    UploadAndNotifyProgressResponse {
        message: format!("Received {received_bytes} bytes"),
        received_bytes,
    }
}

/// Handles of a running progress upload.
#[derive(Debug)]
pub struct ProgressUpload {
    /// Progress notices, ending once both loops have finished.
    pub notices: ReceiverStream<Result<UploadAndNotifyProgressResponse, Status>>,
    /// Fires after both loops have finished, with the committed size.
    pub done: oneshot::Receiver<TransferResult<u64>>,
}

/// Receives a blob's chunks while acknowledging each one.
#[derive(Debug, Clone)]
pub struct ProgressUploadSession {
    store: Arc<dyn TransferStore>,
    capacity: usize,
}

impl ProgressUploadSession {
    /// Create a session writing into `store`.
    pub fn new(store: Arc<dyn TransferStore>, config: &TransferConfig) -> Self {
        Self {
            store,
            capacity: config.channel_capacity.max(1),
        }
    }

    /// Spawn the ingest and notify loops over `inbound`.
    pub fn start<S>(self, inbound: Inbound<S>) -> ProgressUpload
    where
        S: Stream<Item = Result<UploadAndNotifyProgressRequest, Status>> + Unpin + Send + 'static,
    {
        let (sink, notices) = channel::outbound(self.capacity);
        let (progress, progress_rx) = channel::outbound::<u64>(self.capacity);
        let (done_tx, done) = oneshot::channel();

        let ingest = tokio::spawn(ingest(inbound, progress));
        let notify = tokio::spawn(notify(progress_rx, sink.clone()));
        let store = self.store;

        tokio::spawn(async move {
            let (ingested, notified) = tokio::join!(ingest, notify);
            let ingested = ingested.unwrap_or_else(|e| Err(join_failure("ingest", e)));
            let notified = notified.unwrap_or_else(|e| Err(join_failure("notify", e)));

            let outcome = match (ingested, notified) {
                (Ok((name, blob)), Ok(sent)) => {
                    commit(&*store, &name, blob).await.inspect(|size| {
                        tracing::info!(
                            filename = %name,
                            size,
                            notices = sent,
                            "progress upload committed"
                        );
                    })
                }
                (Err(e), _) | (_, Err(e)) => Err(e),
            };

            match &outcome {
                Ok(_) => {}
                Err(TransferError::ChannelClosed) => {
                    tracing::debug!("client went away mid-upload, nothing written");
                }
                Err(e) => {
                    tracing::warn!(kind = e.kind(), error = %e, "progress upload failed");
                    sink.abort(to_status(e.clone())).await;
                }
            }

            // Response stream ends here, after any error status
            drop(sink);
            let _ = done_tx.send(outcome);
        });

        ProgressUpload { notices, done }
    }
}

/// Receive chunks until end of stream, reporting the running total after
/// each one. Yields the target name and the reassembled blob.
async fn ingest<S>(
    mut inbound: Inbound<S>,
    progress: Outbound<u64>,
) -> TransferResult<(String, Vec<u8>)>
where
    S: Stream<Item = Result<UploadAndNotifyProgressRequest, Status>> + Unpin,
{
    let mut target = TargetName::default();
    let mut buf = Reassembler::new();

    while let Some(msg) = inbound.receive().await? {
        target.observe(&msg.filename)?;
        let total = buf.push(&msg.data);
        tracing::debug!(bytes = msg.data.len(), total, "received chunk");
        progress.send(total).await?;
    }

    Ok((target.into_name()?, buf.finish()))
}

/// Write the blob only once every notice has been handed to the peer.
async fn commit(store: &dyn TransferStore, name: &str, blob: Vec<u8>) -> TransferResult<u64> {
    let size = blob.len() as u64;
    store.put(name, &blob).await?;
    Ok(size)
}

/// Turn each running total into a notice, in order.
async fn notify(
    mut progress: ReceiverStream<u64>,
    sink: ResponseSink<UploadAndNotifyProgressResponse>,
) -> TransferResult<u64> {
    let mut sent = 0;
    while let Some(total) = progress.next().await {
        sink.emit(progress_notice(total)).await?;
        sent += 1;
    }
    Ok(sent)
}

fn join_failure(task: &str, err: tokio::task::JoinError) -> TransferError {
    TransferError::Internal(format!("{task} task failed: {err}"))
}
