//! Directory-backed blob store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{BlobReader, StoreError, TransferStore, validate_name};

/// Prefix of in-flight upload files. Valid blob names never start with `.`.
const TEMP_PREFIX: &str = ".ferry-upload-";

/// Blob store over a flat directory: one regular file per blob.
///
/// Writes land in a hidden temporary file next to the target and are renamed
/// over it once complete.
#[derive(Debug)]
pub struct LocalDirStore {
    root: PathBuf,
    next_temp: AtomicU64,
}

impl LocalDirStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open_dir(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        tracing::debug!(root = %root.display(), "opened blob directory");
        Ok(Self {
            root,
            next_temp: AtomicU64::new(1),
        })
    }

    /// Directory holding the blobs.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        let n = self.next_temp.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!("{TEMP_PREFIX}{}-{n}-{name}", std::process::id()))
    }
}

#[async_trait]
impl TransferStore for LocalDirStore {
    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            // Non-UTF-8 names cannot be requested over the wire anyway
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            // Hidden entries, in-flight uploads included, cannot be opened by name
            if validate_name(&name).is_err() {
                continue;
            }
            names.push(name);
        }
        Ok(names)
    }

    async fn open(&self, name: &str) -> Result<BlobReader, StoreError> {
        let path = self.blob_path(name)?;
        match fs::File::open(&path).await {
            Ok(file) => {
                if !file.metadata().await?.is_file() {
                    return Err(StoreError::NotFound(name.to_string()));
                }
                Ok(Box::pin(file))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        let target = self.blob_path(name)?;
        let temp = self.temp_path(name);

        let written = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&temp, &target).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp).await {
                tracing::debug!(
                    path = %temp.display(),
                    error = %cleanup,
                    "temp file cleanup failed"
                );
            }
            return Err(StoreError::Io(e));
        }

        tracing::debug!(name, bytes = data.len(), "blob committed");
        Ok(())
    }
}
