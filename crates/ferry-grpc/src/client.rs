//! Typed client for the file transfer service.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use ferry::{DEFAULT_CHANNEL_CAPACITY, Reassembler, TransferError, TransferResult, split};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic::{Request, Status, Streaming};

use crate::channel::{self, ClientStreamCall};
use crate::interceptor::AUTHORIZATION_HEADER;
use crate::proto::file_service_client::FileServiceClient;
use crate::proto::{
    DownloadRequest, DownloadResponse, ListFilesRequest, UploadAndNotifyProgressRequest,
    UploadAndNotifyProgressResponse, UploadRequest, UploadResponse,
};
use crate::status::from_status;

/// A progress notice received during an upload.
pub type ProgressNotice = UploadAndNotifyProgressResponse;

/// How to reach the server.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server URI, e.g. `http://[::1]:50051`.
    pub addr: String,
    /// Bearer token attached to every call.
    pub token: Option<String>,
    /// PEM trust root. Enables TLS.
    pub ca_cert: Option<PathBuf>,
    /// TLS server name, when it differs from the address host.
    pub domain: Option<String>,
    /// Pause between upload messages.
    pub pace: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            addr: "http://[::1]:50051".to_string(),
            token: None,
            ca_cert: None,
            domain: None,
            pace: Duration::ZERO,
        }
    }
}

impl ClientOptions {
    /// Options for a plaintext connection to `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Present `token` on every call.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Attaches the bearer credential to outgoing calls.
#[derive(Clone)]
struct BearerToken {
    header: Option<MetadataValue<Ascii>>,
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("set", &self.header.is_some())
            .finish()
    }
}

impl BearerToken {
    fn new(token: Option<&str>) -> TransferResult<Self> {
        let header = token
            .map(|t| {
                format!("Bearer {t}").parse::<MetadataValue<Ascii>>().map_err(|_| {
                    TransferError::InvalidArgument("token is not valid header text".to_string())
                })
            })
            .transpose()?;
        Ok(Self { header })
    }
}

impl Interceptor for BearerToken {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(header) = &self.header {
            request
                .metadata_mut()
                .insert(AUTHORIZATION_HEADER, header.clone());
        }
        Ok(request)
    }
}

type Inner = FileServiceClient<InterceptedService<Channel, BearerToken>>;

/// Client for the `FileService` RPCs.
///
/// Cheap to clone; clones share the underlying connection.
#[derive(Clone)]
pub struct FileClient {
    inner: Inner,
    pace: Duration,
}

impl fmt::Debug for FileClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileClient")
            .field("pace", &self.pace)
            .finish_non_exhaustive()
    }
}

impl FileClient {
    /// Connect to the server described by `options`.
    pub async fn connect(options: ClientOptions) -> TransferResult<Self> {
        let mut endpoint = Channel::from_shared(options.addr.clone()).map_err(|e| {
            TransferError::InvalidArgument(format!("invalid address {}: {e}", options.addr))
        })?;

        if let Some(ca_cert) = &options.ca_cert {
            let pem = tokio::fs::read(ca_cert).await?;
            let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
            if let Some(domain) = &options.domain {
                tls = tls.domain_name(domain.clone());
            }
            endpoint = endpoint.tls_config(tls).map_err(transport)?;
        }

        let channel = endpoint.connect().await.map_err(transport)?;
        tracing::debug!(addr = %options.addr, tls = options.ca_cert.is_some(), "connected");

        let bearer = BearerToken::new(options.token.as_deref())?;
        Ok(Self {
            inner: FileServiceClient::with_interceptor(channel, bearer),
            pace: options.pace,
        })
    }

    /// Names of all files on the server.
    pub async fn list_files(&self) -> TransferResult<Vec<String>> {
        let response = self
            .inner
            .clone()
            .list_files(ListFilesRequest {})
            .await
            .map_err(from_status)?;
        Ok(response.into_inner().filenames)
    }

    /// Start downloading `filename`.
    ///
    /// With a `timeout`, the server is told the deadline and every receive is
    /// bounded by it locally as well.
    pub async fn download(
        &self,
        filename: &str,
        timeout: Option<Duration>,
    ) -> TransferResult<Download> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut request = Request::new(DownloadRequest {
            filename: filename.to_string(),
        });
        if let Some(timeout) = timeout {
            request.set_timeout(timeout);
        }

        let mut client = self.inner.clone();
        let call = async move { client.download(request).await.map_err(from_status) };
        let response = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, call)
                .await
                .map_err(|_| timed_out())??,
            None => call.await?,
        };

        Ok(Download {
            stream: response.into_inner(),
            deadline,
            received: 0,
        })
    }

    /// Download `filename` completely.
    pub async fn download_all(
        &self,
        filename: &str,
        timeout: Option<Duration>,
    ) -> TransferResult<Vec<u8>> {
        let mut download = self.download(filename, timeout).await?;
        let mut buf = Reassembler::new();
        while let Some(chunk) = download.next_chunk().await? {
            buf.push(&chunk);
        }
        Ok(buf.finish())
    }

    /// Upload `payload` as `filename` over a client stream; returns the size
    /// the server committed.
    pub async fn upload(
        &self,
        filename: &str,
        payload: &[u8],
        chunk_size: usize,
    ) -> TransferResult<u64> {
        let frames = frames(filename, payload, chunk_size)?;
        let mut client = self.inner.clone();
        let call = ClientStreamCall::<UploadRequest, UploadResponse>::start(
            DEFAULT_CHANNEL_CAPACITY,
            move |requests| async move { client.upload(requests).await },
        );

        let mut delivered = true;
        for (index, (filename, data)) in frames.into_iter().enumerate() {
            if index > 0 {
                self.pause().await;
            }
            tracing::debug!(chunk = index, bytes = data.len(), "sending chunk");
            if call.send(UploadRequest { data, filename }).await.is_err() {
                // The server ended the call; its status arrives with the response
                delivered = false;
                break;
            }
        }

        let response = call.close_and_await_result().await?;
        if !delivered {
            return Err(TransferError::ChannelClosed);
        }
        Ok(response.size)
    }

    /// Upload `payload` as `filename` over a bidirectional stream, collecting
    /// the server's progress notices.
    ///
    /// Sending and receiving run as separate tasks; this returns once both
    /// have finished.
    pub async fn upload_with_progress(
        &self,
        filename: &str,
        payload: &[u8],
        chunk_size: usize,
    ) -> TransferResult<Vec<ProgressNotice>> {
        let frames = frames(filename, payload, chunk_size)?;
        let (requests, stream) =
            channel::outbound::<UploadAndNotifyProgressRequest>(DEFAULT_CHANNEL_CAPACITY);
        let pace = self.pace;

        let sender = tokio::spawn(async move {
            for (index, (filename, data)) in frames.into_iter().enumerate() {
                if index > 0 && !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                requests
                    .send(UploadAndNotifyProgressRequest { data, filename })
                    .await?;
            }
            requests.close();
            Ok::<_, TransferError>(())
        });

        let mut client = self.inner.clone();
        let notices = match client.upload_and_notify_progress(stream).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                sender.abort();
                return Err(from_status(status));
            }
        };

        let (done_tx, done) = oneshot::channel();
        tokio::spawn(async move {
            let _ = done_tx.send(collect_notices(notices).await);
        });

        let (sent, received) = tokio::join!(sender, done);
        let sent = sent.map_err(|e| TransferError::Internal(format!("sender task failed: {e}")))?;
        let received = received
            .map_err(|_| TransferError::Internal("receiver task dropped its result".to_string()))?;

        // A server status explains a failed send better than the send does
        let notices = received?;
        sent?;
        Ok(notices)
    }

    async fn pause(&self) {
        if !self.pace.is_zero() {
            tokio::time::sleep(self.pace).await;
        }
    }
}

/// An in-progress download.
pub struct Download {
    stream: Streaming<DownloadResponse>,
    deadline: Option<Instant>,
    received: u64,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("deadline", &self.deadline)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl Download {
    /// The next chunk, or `None` once the server has ended the stream.
    pub async fn next_chunk(&mut self) -> TransferResult<Option<Vec<u8>>> {
        let next = self.stream.message();
        let msg = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, next)
                .await
                .map_err(|_| timed_out())?,
            None => next.await,
        };
        match msg.map_err(from_status)? {
            Some(DownloadResponse { data }) => {
                self.received += data.len() as u64;
                tracing::debug!(bytes = data.len(), total = self.received, "received chunk");
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Bytes received so far.
    pub fn received(&self) -> u64 {
        self.received
    }
}

async fn collect_notices(
    mut stream: Streaming<UploadAndNotifyProgressResponse>,
) -> TransferResult<Vec<ProgressNotice>> {
    let mut notices = Vec::new();
    while let Some(notice) = stream.message().await.map_err(from_status)? {
        tracing::info!(received_bytes = notice.received_bytes, "{}", notice.message);
        notices.push(notice);
    }
    Ok(notices)
}

/// Split `payload` into upload messages. The first names the target; an
/// empty payload still produces one message.
fn frames(
    filename: &str,
    payload: &[u8],
    chunk_size: usize,
) -> TransferResult<Vec<(String, Vec<u8>)>> {
    let mut frames: Vec<_> = split(payload, chunk_size)?
        .map(|chunk| (String::new(), chunk.to_vec()))
        .collect();
    if frames.is_empty() {
        frames.push((String::new(), Vec::new()));
    }
    if let Some(first) = frames.first_mut() {
        first.0 = filename.to_string();
    }
    Ok(frames)
}

fn transport(err: tonic::transport::Error) -> TransferError {
    TransferError::Transport(err.to_string())
}

fn timed_out() -> TransferError {
    TransferError::DeadlineExceeded("client deadline elapsed".to_string())
}
