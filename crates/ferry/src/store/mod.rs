//! Named-blob storage.
//!
//! This module provides:
//! - `TransferStore` - the three operations transfer sessions rely on
//! - `LocalDirStore` - a flat directory of files
//! - `MemoryStore` - an in-memory map, for tests and embedding
//!
//! A `put` always replaces the whole blob. Readers never observe a partially
//! written blob.

mod local;
mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::error::TransferError;

pub use local::LocalDirStore;
pub use memory::MemoryStore;

/// Readable handle to a blob's content.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Errors from a blob store
#[derive(Debug, Error)]
pub enum StoreError {
    /// No blob with this name
    #[error("no such blob: {0}")]
    NotFound(String),
    /// The name cannot identify a blob
    #[error("invalid blob name: {0:?}")]
    InvalidName(String),
    /// Underlying I/O failure
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => TransferError::NotFound(name),
            StoreError::InvalidName(name) => {
                TransferError::InvalidArgument(format!("invalid blob name: {name:?}"))
            }
            StoreError::Io(e) => TransferError::Internal(e.to_string()),
        }
    }
}

/// A named-blob repository.
#[async_trait]
pub trait TransferStore: Send + Sync + std::fmt::Debug {
    /// Names of all blobs currently held, in store order.
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Open a blob for reading.
    async fn open(&self, name: &str) -> Result<BlobReader, StoreError>;

    /// Create or fully replace a blob.
    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StoreError>;
}

/// Check that `name` identifies a blob in a flat namespace.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
