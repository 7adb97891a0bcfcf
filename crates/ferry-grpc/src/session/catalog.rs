//! Unary file listing.

use std::sync::Arc;

use ferry::{TransferError, TransferResult, TransferStore};

/// Lists the blobs held by a store.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    store: Arc<dyn TransferStore>,
}

impl FileCatalog {
    /// Create a catalog over `store`.
    pub fn new(store: Arc<dyn TransferStore>) -> Self {
        Self { store }
    }

    /// All blob names, in the order the store enumerates them.
    ///
    /// Any enumeration failure is reported as [`TransferError::Internal`].
    pub async fn list_names(&self) -> TransferResult<Vec<String>> {
        let names = self
            .store
            .list()
            .await
            .map_err(|e| TransferError::Internal(e.to_string()))?;
        tracing::debug!(count = names.len(), "listed files");
        Ok(names)
    }
}
