//! Ferry gRPC Service
//!
//! A gRPC file-transfer service over a flat blob store, exercising all four
//! RPC shapes:
//!
//! | RPC | Shape | Session |
//! |---|---|---|
//! | `ListFiles` | unary | [`FileCatalog`] |
//! | `Download` | server streaming | [`DownloadSession`] |
//! | `Upload` | client streaming | [`UploadSession`] |
//! | `UploadAndNotifyProgress` | bidirectional | [`ProgressUploadSession`] |
//!
//! # Architecture
//!
//! Every call passes through an [`InterceptorChain`] (logging, then
//! authentication) before its session runs. Sessions only talk to the wire
//! through the [`channel`] types and to storage through
//! [`ferry::TransferStore`], so they can be driven in tests without a server.
//!
//! # Example Flow
//!
//! ```text
//! Client                                         Server
//! │                                                │
//! │  UploadAndNotifyProgress{filename, "sport"}    │
//! │ ──────────────────────────────────────────────>│
//! │                                                │
//! │       {message: "Received 5 bytes"}            │
//! │<────────────────────────────────────────────── │
//! │                                                │
//! │  UploadAndNotifyProgress{"s"}                  │
//! │ ──────────────────────────────────────────────>│
//! │                                                │
//! │       {message: "Received 6 bytes"}            │
//! │<────────────────────────────────────────────── │
//! │                                                │
//! │  (end of stream)                               │
//! │ ──────────────────────────────────────────────>│
//! │                                   blob written │
//! │       (end of stream, OK)                      │
//! │<────────────────────────────────────────────── │
//! ```

pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("ferry.v1");
}

pub mod channel;
mod client;
pub mod deadline;
pub mod interceptor;
mod server;
mod service;
pub mod session;
pub mod status;

pub use client::{ClientOptions, Download, FileClient, ProgressNotice};
pub use interceptor::{
    ActiveCalls, AuthInterceptor, InterceptorChain, LoggingInterceptor, StreamReply,
};
pub use server::{TlsFiles, TransferServer};
pub use service::FileTransferService;
pub use session::{DownloadSession, FileCatalog, ProgressUploadSession, UploadSession};

// Re-export proto types for convenience
pub use proto::{
    file_service_client::FileServiceClient,
    file_service_server::FileServiceServer as FileServiceGrpcServer,
};
