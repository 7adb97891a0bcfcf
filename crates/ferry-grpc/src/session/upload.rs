//! Client-streaming upload.

use std::sync::Arc;

use ferry::{Reassembler, TransferResult, TransferStore};
use tokio_stream::Stream;
use tonic::Status;

use super::TargetName;
use crate::channel::Inbound;
use crate::proto::{UploadRequest, UploadResponse};

/// Receives a blob's chunks and writes it once the stream ends.
///
/// The blob is buffered in memory and committed in one `put`, so a failed
/// or abandoned upload leaves the store untouched.
#[derive(Debug, Clone)]
pub struct UploadSession {
    store: Arc<dyn TransferStore>,
}

impl UploadSession {
    /// Create a session writing into `store`.
    pub fn new(store: Arc<dyn TransferStore>) -> Self {
        Self { store }
    }

    /// Drain `inbound`, commit the blob and report its size.
    pub async fn run<S>(&self, mut inbound: Inbound<S>) -> TransferResult<UploadResponse>
    where
        S: Stream<Item = Result<UploadRequest, Status>> + Unpin,
    {
        let mut target = TargetName::default();
        let mut buf = Reassembler::new();

        while let Some(msg) = inbound.receive().await? {
            target.observe(&msg.filename)?;
            let total = buf.push(&msg.data);
            tracing::debug!(bytes = msg.data.len(), total, "received chunk");
        }

        let name = target.into_name()?;
        let chunks = buf.chunk_count();
        let size = buf.len();
        self.store.put(&name, &buf.finish()).await?;

        tracing::info!(filename = %name, chunks, size, "upload committed");
        Ok(UploadResponse { size })
    }
}

#[cfg(test)]
mod tests {
    use ferry::{MemoryStore, TransferError};

    use super::*;
    use crate::status::to_status;

    fn request(filename: &str, data: &[u8]) -> Result<UploadRequest, Status> {
        Ok(UploadRequest {
            data: data.to_vec(),
            filename: filename.to_string(),
        })
    }

    #[tokio::test]
    async fn reassembles_and_reports_size() {
        let store = Arc::new(MemoryStore::new());
        let session = UploadSession::new(store.clone());

        let inbound = Inbound::new(tokio_stream::iter(vec![
            request("sports.txt", b"sport"),
            request("", b"s"),
        ]));
        let response = session.run(inbound).await.unwrap();

        assert_eq!(response.size, 6);
        assert_eq!(store.get("sports.txt").await.unwrap(), b"sports");
    }

    #[tokio::test]
    async fn overwrites_existing_blob() {
        let store = Arc::new(MemoryStore::with_blobs([("a.txt", "previous content")]));
        let session = UploadSession::new(store.clone());

        let inbound = Inbound::new(tokio_stream::iter(vec![request("a.txt", b"new")]));
        assert_eq!(session.run(inbound).await.unwrap().size, 3);
        assert_eq!(store.get("a.txt").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn receive_error_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let session = UploadSession::new(store.clone());

        let inbound = Inbound::new(tokio_stream::iter(vec![
            request("partial.txt", b"first"),
            Err(Status::cancelled("client reset")),
        ]));
        let err = session.run(inbound).await.unwrap_err();

        assert_eq!(err, TransferError::ChannelClosed);
        assert!(store.get("partial.txt").await.is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_internal() {
        let store = Arc::new(MemoryStore::new());
        let session = UploadSession::new(store.clone());

        let inbound = Inbound::new(tokio_stream::iter(vec![
            request("partial.txt", b"first"),
            Err(Status::out_of_range("decoded message length too large")),
        ]));
        let err = session.run(inbound).await.unwrap_err();

        assert_eq!(
            err,
            TransferError::Internal("decoded message length too large".to_string())
        );
        assert_eq!(to_status(err).code(), tonic::Code::Internal);
        assert!(store.get("partial.txt").await.is_none());
    }

    #[tokio::test]
    async fn missing_name_is_invalid() {
        let store = Arc::new(MemoryStore::new());
        let session = UploadSession::new(store.clone());

        let inbound = Inbound::new(tokio_stream::iter(vec![request("", b"data")]));
        assert!(matches!(
            session.run(inbound).await,
            Err(TransferError::InvalidArgument(_))
        ));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_stream_is_invalid() {
        let session = UploadSession::new(Arc::new(MemoryStore::new()));
        let inbound = Inbound::new(tokio_stream::iter(Vec::<Result<UploadRequest, Status>>::new()));
        assert!(matches!(
            session.run(inbound).await,
            Err(TransferError::InvalidArgument(_))
        ));
    }
}
