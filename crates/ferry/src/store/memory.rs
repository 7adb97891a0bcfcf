//! In-memory blob store.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BlobReader, StoreError, TransferStore, validate_name};

/// Blob store backed by an ordered map. Lists names in sorted order.
///
/// Each blob is held behind an `Arc`, so readers keep a consistent snapshot
/// even if the blob is replaced while they read.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<BTreeMap<String, Arc<Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `blobs`.
    pub fn with_blobs<I, N, D>(blobs: I) -> Self
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: Into<Vec<u8>>,
    {
        let map = blobs
            .into_iter()
            .map(|(name, data)| (name.into(), Arc::new(data.into())))
            .collect();
        Self {
            blobs: RwLock::new(map),
        }
    }

    /// Current content of a blob, if present.
    pub async fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.read().await.get(name).map(|b| b.as_ref().clone())
    }
}

/// Read-only view over a shared blob.
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }

    async fn open(&self, name: &str) -> Result<BlobReader, StoreError> {
        validate_name(name)?;
        let blobs = self.blobs.read().await;
        let blob = blobs
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(Box::pin(Cursor::new(SharedBytes(blob))))
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        validate_name(name)?;
        let mut blobs = self.blobs.write().await;
        blobs.insert(name.to_string(), Arc::new(data.to_vec()));
        Ok(())
    }
}
