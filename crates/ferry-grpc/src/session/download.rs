//! Server-streaming download.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ferry::{BlobReader, ChunkReader, TransferConfig, TransferError, TransferResult, TransferStore};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use crate::channel::{self, ResponseSink};
use crate::proto::DownloadResponse;
use crate::status::to_status;

/// A download in flight.
#[derive(Debug)]
pub struct DownloadTransfer {
    /// Chunks for the caller, ending with an error status on failure
    pub chunks: ReceiverStream<Result<DownloadResponse, Status>>,
    /// Chunk count and byte total once the last chunk was handed over, or
    /// the error that ended the stream
    pub done: oneshot::Receiver<TransferResult<(u64, u64)>>,
}

/// Streams one blob to the caller in fixed-size chunks.
#[derive(Debug, Clone)]
pub struct DownloadSession {
    store: Arc<dyn TransferStore>,
    chunk_size: usize,
    pace: Duration,
    capacity: usize,
}

impl DownloadSession {
    /// Create a session reading from `store` with the given settings.
    pub fn new(store: Arc<dyn TransferStore>, config: &TransferConfig) -> Self {
        Self {
            store,
            chunk_size: config.chunk_size,
            pace: config.pace,
            capacity: config.channel_capacity,
        }
    }

    /// Open `filename` and start streaming it.
    ///
    /// A missing blob fails here, before any chunk is sent. Later failures
    /// terminate the returned stream with an error status: `Internal` for
    /// read errors, `DeadlineExceeded` once `deadline` passes.
    pub async fn start(
        self,
        filename: String,
        deadline: Option<Instant>,
    ) -> TransferResult<DownloadTransfer> {
        let reader = self.store.open(&filename).await?;
        let chunks = ChunkReader::new(reader, self.chunk_size)?;
        let (sink, stream) = channel::outbound(self.capacity.max(1));
        let (done_tx, done) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = self.pump(chunks, &sink, deadline).await;
            match &outcome {
                Ok((count, bytes)) => {
                    tracing::info!(filename, chunks = count, bytes, "download complete");
                }
                Err(TransferError::ChannelClosed) => {
                    tracing::debug!(filename, "client went away mid-download");
                }
                Err(e) => {
                    tracing::warn!(filename, kind = e.kind(), error = %e, "download aborted");
                    sink.abort(to_status(e.clone())).await;
                }
            }
            drop(sink);
            let _ = done_tx.send(outcome);
        });

        Ok(DownloadTransfer {
            chunks: stream,
            done,
        })
    }

    async fn pump(
        &self,
        mut chunks: ChunkReader<BlobReader>,
        sink: &ResponseSink<DownloadResponse>,
        deadline: Option<Instant>,
    ) -> TransferResult<(u64, u64)> {
        let mut sent = 0u64;
        loop {
            if sent > 0 && !self.pace.is_zero() {
                pace(self.pace, deadline).await?;
            }
            let Some(data) = within(deadline, chunks.next_chunk()).await? else {
                break;
            };
            tracing::debug!(chunk = sent, bytes = data.len(), "sending chunk");
            within(deadline, sink.emit(DownloadResponse { data })).await?;
            sent += 1;
        }
        Ok((sent, chunks.offset()))
    }
}

fn deadline_exceeded() -> TransferError {
    TransferError::DeadlineExceeded("download deadline elapsed".to_string())
}

/// Run `fut`, failing with `DeadlineExceeded` if `deadline` passes first.
async fn within<T, F>(deadline: Option<Instant>, fut: F) -> TransferResult<T>
where
    F: Future<Output = TransferResult<T>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| deadline_exceeded())?,
        None => fut.await,
    }
}

/// Sleep for one pacing interval, cut short by the deadline.
async fn pace(interval: Duration, deadline: Option<Instant>) -> TransferResult<()> {
    let wake = Instant::now() + interval;
    match deadline {
        Some(deadline) if deadline < wake => {
            tokio::time::sleep_until(deadline).await;
            Err(deadline_exceeded())
        }
        _ => {
            tokio::time::sleep_until(wake).await;
            Ok(())
        }
    }
}
