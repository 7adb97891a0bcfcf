//! Tonic service wiring: every RPC runs its session inside the interceptor chain.

use std::sync::Arc;

use ferry::{TransferConfig, TransferResult, TransferStore};
use tokio::sync::oneshot;
use tonic::{Request, Response, Status, Streaming};

use crate::channel::{Inbound, ResponseStream};
use crate::deadline;
use crate::interceptor::{Call, CallOutcome, Describe, InterceptorChain, Method, StreamReply};
use crate::proto::{
    self, DownloadRequest, DownloadResponse, ListFilesRequest, ListFilesResponse,
    UploadAndNotifyProgressRequest, UploadAndNotifyProgressResponse, UploadRequest,
    UploadResponse,
};
use crate::session::{DownloadSession, FileCatalog, ProgressUploadSession, UploadSession};
use crate::status::to_status;

/// Request rendering for call logs when the input is a stream.
const STREAMED_INPUT: &str = "<stream>";

impl Describe for ListFilesResponse {
    fn describe(&self) -> String {
        format!("{} files", self.filenames.len())
    }
}

impl Describe for UploadResponse {
    fn describe(&self) -> String {
        format!("{} bytes", self.size)
    }
}

/// Wait for a streaming session's result and render it for call logs.
async fn settle<T>(
    done: oneshot::Receiver<TransferResult<T>>,
    describe: impl FnOnce(T) -> String,
) -> CallOutcome {
    match done.await {
        Ok(Ok(value)) => CallOutcome::Ok(describe(value)),
        Ok(Err(e)) => CallOutcome::failed(&to_status(e)),
        Err(_) => CallOutcome::failed(&Status::internal("session ended without a result")),
    }
}

/// The `FileService` implementation.
#[derive(Debug, Clone)]
pub struct FileTransferService {
    store: Arc<dyn TransferStore>,
    config: TransferConfig,
    chain: Arc<InterceptorChain>,
}

impl FileTransferService {
    /// Serve `store` with `config`, wrapping every call in `chain`.
    pub fn new(
        store: Arc<dyn TransferStore>,
        config: TransferConfig,
        chain: InterceptorChain,
    ) -> Self {
        Self {
            store,
            config,
            chain: Arc::new(chain),
        }
    }

    /// Wrap in the generated tonic server.
    pub fn into_server(self) -> proto::file_service_server::FileServiceServer<Self> {
        proto::file_service_server::FileServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl proto::file_service_server::FileService for FileTransferService {
    type DownloadStream = ResponseStream<DownloadResponse>;
    type UploadAndNotifyProgressStream = ResponseStream<UploadAndNotifyProgressResponse>;

    async fn list_files(
        &self,
        request: Request<ListFilesRequest>,
    ) -> Result<Response<ListFilesResponse>, Status> {
        let call = Call::new(
            Method::ListFiles,
            request.metadata().clone(),
            format!("{:?}", request.get_ref()),
        );
        let catalog = FileCatalog::new(self.store.clone());

        self.chain
            .run(call, move |_| async move {
                let filenames = catalog.list_names().await.map_err(to_status)?;
                Ok(Response::new(ListFilesResponse { filenames }))
            })
            .await
    }

    async fn download(
        &self,
        request: Request<DownloadRequest>,
    ) -> Result<Response<Self::DownloadStream>, Status> {
        let deadline = deadline::from_metadata(request.metadata());
        let call = Call::new(
            Method::Download,
            request.metadata().clone(),
            format!("{:?}", request.get_ref()),
        );
        let filename = request.into_inner().filename;
        let session = DownloadSession::new(self.store.clone(), &self.config);

        let reply = self
            .chain
            .run(call, move |_| async move {
                let transfer = session.start(filename, deadline).await.map_err(to_status)?;
                let done = settle(transfer.done, |(chunks, bytes)| {
                    format!("{chunks} chunks, {bytes} bytes")
                });
                Ok(Response::new(StreamReply::new(transfer.chunks, done)))
            })
            .await?;
        Ok(reply.map(StreamReply::into_stream))
    }

    async fn upload(
        &self,
        request: Request<Streaming<UploadRequest>>,
    ) -> Result<Response<UploadResponse>, Status> {
        let call = Call::new(Method::Upload, request.metadata().clone(), STREAMED_INPUT);
        let inbound = Inbound::new(request.into_inner());
        let session = UploadSession::new(self.store.clone());

        self.chain
            .run(call, move |_| async move {
                session.run(inbound).await.map(Response::new).map_err(to_status)
            })
            .await
    }

    async fn upload_and_notify_progress(
        &self,
        request: Request<Streaming<UploadAndNotifyProgressRequest>>,
    ) -> Result<Response<Self::UploadAndNotifyProgressStream>, Status> {
        let call = Call::new(
            Method::UploadAndNotifyProgress,
            request.metadata().clone(),
            STREAMED_INPUT,
        );
        let inbound = Inbound::new(request.into_inner());
        let session = ProgressUploadSession::new(self.store.clone(), &self.config);

        let reply = self
            .chain
            .run(call, move |_| async move {
                let upload = session.start(inbound);
                let done = settle(upload.done, |size| format!("{size} bytes"));
                Ok(Response::new(StreamReply::new(upload.notices, done)))
            })
            .await?;
        Ok(reply.map(StreamReply::into_stream))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ferry::MemoryStore;
    use proto::file_service_server::FileService;
    use tokio_stream::StreamExt;
    use tonic::Code;
    use tonic::metadata::MetadataValue;

    use super::*;
    use crate::interceptor::{CallRecord, LoggingInterceptor};

    fn service(chain: InterceptorChain) -> FileTransferService {
        let store = MemoryStore::with_blobs([("name.txt", "hello world")]);
        FileTransferService::new(Arc::new(store), TransferConfig::default().unpaced(), chain)
    }

    fn authorized<T>(msg: T, token: &str) -> Request<T> {
        let mut request = Request::new(msg);
        let value: MetadataValue<_> = format!("Bearer {token}").parse().unwrap();
        request.metadata_mut().insert("authorization", value);
        request
    }

    #[tokio::test]
    async fn list_files_through_chain() {
        let svc = service(InterceptorChain::standard("secret"));
        let response = svc
            .list_files(authorized(ListFilesRequest {}, "secret"))
            .await
            .unwrap();
        assert_eq!(response.into_inner().filenames, vec!["name.txt"]);
    }

    #[tokio::test]
    async fn unauthenticated_call_is_rejected() {
        let svc = service(InterceptorChain::standard("secret"));
        let status = svc
            .list_files(Request::new(ListFilesRequest {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn download_streams_chunks() {
        let svc = service(InterceptorChain::new());
        let request = Request::new(DownloadRequest {
            filename: "name.txt".to_string(),
        });
        let stream = svc.download(request).await.unwrap().into_inner();
        let chunks: Vec<Vec<u8>> = stream.map(|r| r.unwrap().data).collect().await;
        assert_eq!(chunks.concat(), b"hello world");
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn download_missing_is_not_found() {
        let svc = service(InterceptorChain::new());
        let request = Request::new(DownloadRequest {
            filename: "missing.txt".to_string(),
        });
        let status = svc.download(request).await.err().unwrap();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "file not found: missing.txt");
    }

    fn recorded_chain() -> (
        InterceptorChain,
        tokio::sync::mpsc::UnboundedReceiver<CallRecord>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let chain = InterceptorChain::new().with(LoggingInterceptor::with_observer(
            move |record| {
                let _ = tx.send(record.clone());
            },
        ));
        (chain, rx)
    }

    #[tokio::test]
    async fn download_record_waits_for_last_chunk() {
        let (chain, mut records) = recorded_chain();
        let svc = service(chain);
        let request = Request::new(DownloadRequest {
            filename: "name.txt".to_string(),
        });
        let stream = svc.download(request).await.unwrap().into_inner();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 3);

        let record = records.recv().await.unwrap();
        assert_eq!(record.method, Method::Download);
        assert_eq!(
            record.outcome,
            CallOutcome::Ok("3 chunks, 11 bytes".to_string())
        );
        assert!(records.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn download_deadline_is_recorded_as_failure() {
        let (chain, mut records) = recorded_chain();
        let store = MemoryStore::with_blobs([("name.txt", "hello world")]);
        let config = TransferConfig {
            pace: Duration::from_millis(200),
            ..TransferConfig::default()
        };
        let svc = FileTransferService::new(Arc::new(store), config, chain);

        let mut request = Request::new(DownloadRequest {
            filename: "name.txt".to_string(),
        });
        request
            .metadata_mut()
            .insert("grpc-timeout", "250m".parse().unwrap());
        let mut stream = svc.download(request).await.unwrap().into_inner();

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());
        let status = stream.next().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert!(stream.next().await.is_none());

        let record = records.recv().await.unwrap();
        assert_eq!(record.method, Method::Download);
        assert!(matches!(
            record.outcome,
            CallOutcome::Err {
                code: Code::DeadlineExceeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn progress_upload_failure_is_recorded() {
        let (chain, mut records) = recorded_chain();
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<_, Status>>(4);
        tx.send(Ok(UploadAndNotifyProgressRequest {
            filename: "../escape.txt".to_string(),
            data: b"data".to_vec(),
        }))
        .await
        .unwrap();
        drop(tx);

        let session = ProgressUploadSession::new(store.clone(), &TransferConfig::default());
        let call = Call::new(Method::UploadAndNotifyProgress, Default::default(), STREAMED_INPUT);
        let reply = chain
            .run(call, move |_| async move {
                let upload = session.start(Inbound::new(
                    tokio_stream::wrappers::ReceiverStream::new(rx),
                ));
                let done = settle(upload.done, |size| format!("{size} bytes"));
                Ok(Response::new(StreamReply::new(upload.notices, done)))
            })
            .await
            .unwrap();

        let items: Vec<_> = reply.into_inner().into_stream().collect().await;
        let status = items.last().unwrap().as_ref().unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let record = records.recv().await.unwrap();
        assert_eq!(record.method, Method::UploadAndNotifyProgress);
        assert!(matches!(
            record.outcome,
            CallOutcome::Err {
                code: Code::InvalidArgument,
                ..
            }
        ));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn describes_unary_responses() {
        let list = ListFilesResponse {
            filenames: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(list.describe(), "2 files");
        assert_eq!(UploadResponse { size: 6 }.describe(), "6 bytes");
    }
}
