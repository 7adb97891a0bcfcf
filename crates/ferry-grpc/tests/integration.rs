//! Integration tests for the file transfer RPCs.
//!
//! Each test boots the real tonic server on an ephemeral port and drives it
//! through `FileClient`, the same client the CLI uses.

#![allow(clippy::unwrap_used)] // unwrap is acceptable in tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};

use ferry::{
    BlobReader, LocalDirStore, MemoryStore, StoreError, TransferConfig, TransferError,
    TransferStore,
};
use ferry_grpc::interceptor::{CallOutcome, CallRecord, Method};
use ferry_grpc::{
    AuthInterceptor, ClientOptions, FileClient, FileTransferService, InterceptorChain,
    LoggingInterceptor,
};
use tokio::sync::mpsc;
use tonic::Code;

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("ferry_grpc=debug,ferry=debug")
            .with_test_writer()
            .init();
    });
}

/// Macro to log messages in tests (visible with --nocapture)
macro_rules! test_log {
    ($($arg:tt)*) => {
        eprintln!("[TEST] {}", format!($($arg)*));
    };
}

const TOKEN: &str = "integration-secret";

/// Memory store that counts every access.
#[derive(Debug, Default)]
struct RecordingStore {
    inner: MemoryStore,
    accesses: AtomicUsize,
}

impl RecordingStore {
    fn with_blobs<'a>(blobs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            inner: MemoryStore::with_blobs(blobs),
            accesses: AtomicUsize::new(0),
        }
    }

    fn accesses(&self) -> usize {
        self.accesses.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.accesses.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransferStore for RecordingStore {
    async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.touch();
        self.inner.list().await
    }

    async fn open(&self, name: &str) -> Result<BlobReader, StoreError> {
        self.touch();
        self.inner.open(name).await
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        self.touch();
        self.inner.put(name, data).await
    }
}

fn seeded_store() -> Arc<RecordingStore> {
    Arc::new(RecordingStore::with_blobs([
        ("name.txt", "hello world"),
        ("sports.txt", "sports"),
    ]))
}

/// Start a server over `store` and return its address.
async fn start_server(
    store: Arc<dyn TransferStore>,
    config: TransferConfig,
    token: Option<&str>,
) -> SocketAddr {
    let chain = match token {
        Some(token) => InterceptorChain::standard(token),
        None => InterceptorChain::new().with(LoggingInterceptor::new()),
    };
    start_server_with_chain(store, config, chain).await
}

async fn start_server_with_chain(
    store: Arc<dyn TransferStore>,
    config: TransferConfig,
    chain: InterceptorChain,
) -> SocketAddr {
    init_tracing();
    let addr: SocketAddr = "[::1]:0".parse().unwrap();

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let actual_addr = listener.local_addr().unwrap();
    test_log!("Server bound to {}", actual_addr);

    let service = FileTransferService::new(store, config, chain);

    tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(service.into_server())
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await;
        test_log!("Server task ended: {:?}", result);
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;
    actual_addr
}

async fn connect(addr: SocketAddr, token: Option<&str>) -> FileClient {
    let options = ClientOptions::new(format!("http://{addr}"));
    let options = match token {
        Some(token) => options.token(token),
        None => options,
    };
    FileClient::connect(options).await.unwrap()
}

fn unpaced() -> TransferConfig {
    TransferConfig::default().unpaced()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_list_files() {
    let store = seeded_store();
    let addr = start_server(store.clone(), unpaced(), Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    let names = client.list_files().await.unwrap();
    assert_eq!(names, vec!["name.txt", "sports.txt"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_download_in_chunks() {
    let addr = start_server(seeded_store(), unpaced(), Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    let mut download = client.download("name.txt", None).await.unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = download.next_chunk().await.unwrap() {
        test_log!("chunk {:?}", String::from_utf8_lossy(&chunk));
        chunks.push(chunk);
    }

    assert_eq!(chunks, vec![b"hello".to_vec(), b" worl".to_vec(), b"d".to_vec()]);
    assert_eq!(download.received(), 11);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_download_missing_file() {
    let addr = start_server(seeded_store(), unpaced(), Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    let result = client.download_all("missing.txt", None).await;
    match result {
        Err(TransferError::NotFound(msg)) => assert!(msg.contains("missing.txt"), "{msg}"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_then_download() {
    let store = seeded_store();
    let addr = start_server(store.clone(), unpaced(), Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    let size = assert_ok!(client.upload("uploaded.txt", b"sports", 5).await);
    assert_eq!(size, 6);
    assert_eq!(store.inner.get("uploaded.txt").await.unwrap(), b"sports");

    let data = client.download_all("uploaded.txt", None).await.unwrap();
    assert_eq!(data, b"sports");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_empty_file() {
    let store = seeded_store();
    let addr = start_server(store.clone(), unpaced(), Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    assert_eq!(client.upload("empty.txt", b"", 5).await.unwrap(), 0);
    assert_eq!(store.inner.get("empty.txt").await.unwrap(), b"");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_with_progress() {
    let store = seeded_store();
    let addr = start_server(store.clone(), unpaced(), Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    let notices = client
        .upload_with_progress("progress.txt", b"sports", 5)
        .await
        .unwrap();

    let messages: Vec<&str> = notices.iter().map(|n| n.message.as_str()).collect();
    assert_eq!(messages, vec!["Received 5 bytes", "Received 6 bytes"]);
    assert_eq!(store.inner.get("progress.txt").await.unwrap(), b"sports");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_upload_name_writes_nothing() {
    let store = seeded_store();
    let addr = start_server(store.clone(), unpaced(), Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    let err = client.upload("../escape.txt", b"data", 5).await.unwrap_err();
    assert!(matches!(err, TransferError::InvalidArgument(_)), "{err:?}");

    let err = client
        .upload_with_progress("../escape.txt", b"data", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidArgument(_)), "{err:?}");
    assert_eq!(client.list_files().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streaming_calls_logged_with_final_status() {
    let (tx, mut records) = mpsc::unbounded_channel::<CallRecord>();
    let chain = InterceptorChain::new()
        .with(LoggingInterceptor::with_observer(move |record| {
            let _ = tx.send(record.clone());
        }))
        .with(AuthInterceptor::new(TOKEN));
    let store = seeded_store();
    let addr = start_server_with_chain(store.clone(), unpaced(), chain).await;
    let client = connect(addr, Some(TOKEN)).await;

    let err = client
        .upload_with_progress("../escape.txt", b"data", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidArgument(_)), "{err:?}");

    let record = records.recv().await.unwrap();
    test_log!("recorded {:?}", record);
    assert_eq!(record.method, Method::UploadAndNotifyProgress);
    assert!(
        matches!(
            record.outcome,
            CallOutcome::Err {
                code: Code::InvalidArgument,
                ..
            }
        ),
        "{record:?}"
    );

    let data = client.download_all("name.txt", None).await.unwrap();
    assert_eq!(data, b"hello world");

    let record = records.recv().await.unwrap();
    assert_eq!(record.method, Method::Download);
    assert_eq!(
        record.outcome,
        CallOutcome::Ok("3 chunks, 11 bytes".to_string())
    );
    assert!(store.inner.get("escape.txt").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unauthenticated_calls_never_reach_store() {
    let store = seeded_store();
    let addr = start_server(store.clone(), unpaced(), Some(TOKEN)).await;

    for token in [None, Some("wrong-token")] {
        let client = connect(addr, token).await;

        let err = assert_err!(client.list_files().await);
        assert!(matches!(err, TransferError::Unauthenticated(_)), "{err:?}");

        let err = client.download_all("name.txt", None).await.unwrap_err();
        assert!(matches!(err, TransferError::Unauthenticated(_)), "{err:?}");

        let err = client.upload("new.txt", b"sports", 5).await.unwrap_err();
        assert!(matches!(err, TransferError::Unauthenticated(_)), "{err:?}");

        let err = client
            .upload_with_progress("new.txt", b"sports", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Unauthenticated(_)), "{err:?}");
    }

    assert_eq!(store.accesses(), 0);
    assert!(store.inner.get("new.txt").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_token_configured_allows_calls() {
    let addr = start_server(seeded_store(), unpaced(), None).await;
    let client = connect(addr, None).await;
    assert_eq!(client.list_files().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_download_deadline_exceeded() {
    let config = TransferConfig {
        pace: Duration::from_millis(200),
        ..TransferConfig::default()
    };
    let addr = start_server(seeded_store(), config, Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    // Three chunks 200ms apart cannot finish within 300ms
    let mut download = client
        .download("name.txt", Some(Duration::from_millis(300)))
        .await
        .unwrap();
    let mut received = Vec::new();
    let err = loop {
        match download.next_chunk().await {
            Ok(Some(chunk)) => received.push(chunk),
            Ok(None) => panic!("download finished despite the deadline"),
            Err(e) => break e,
        }
    };

    assert!(matches!(err, TransferError::DeadlineExceeded(_)), "{err:?}");
    assert!(received.len() < 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_paced_download_within_deadline() {
    let config = TransferConfig {
        pace: Duration::from_millis(50),
        ..TransferConfig::default()
    };
    let addr = start_server(seeded_store(), config, Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    let data = client
        .download_all("name.txt", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(data, b"hello world");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_directory_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalDirStore::open_dir(dir.path()).await.unwrap();
    let addr = start_server(Arc::new(store), unpaced(), Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    assert_eq!(client.upload("blob.bin", &payload, 1000).await.unwrap(), 4096);
    let notices = client
        .upload_with_progress("second.bin", &payload[..12], 5)
        .await
        .unwrap();
    assert_eq!(
        notices.iter().map(|n| n.received_bytes).collect::<Vec<_>>(),
        vec![5, 10, 12]
    );

    let mut names = client.list_files().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["blob.bin", "second.bin"]);
    assert_eq!(client.download_all("blob.bin", None).await.unwrap(), payload);
    assert_eq!(
        std::fs::read(dir.path().join("second.bin")).unwrap(),
        &payload[..12]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_downloads() {
    let addr = start_server(seeded_store(), unpaced(), Some(TOKEN)).await;
    let client = connect(addr, Some(TOKEN)).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let client = client.clone();
            let name = if i % 2 == 0 { "name.txt" } else { "sports.txt" };
            tokio::spawn(async move { (name, client.download_all(name, None).await) })
        })
        .collect();

    for handle in handles {
        let (name, result) = handle.await.unwrap();
        let expected: &[u8] = if name == "name.txt" { b"hello world" } else { b"sports" };
        assert_eq!(result.unwrap(), expected);
    }
}
