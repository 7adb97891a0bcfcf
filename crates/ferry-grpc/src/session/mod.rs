//! Per-call session logic, one type per RPC.
//!
//! Sessions talk to the peer only through [`crate::channel`] types and to
//! storage only through [`ferry::TransferStore`]. They report failures as
//! [`ferry::TransferError`]; the service maps those onto status codes.

mod catalog;
mod download;
mod progress;
mod upload;

pub use catalog::FileCatalog;
pub use download::{DownloadSession, DownloadTransfer};
pub use progress::{ProgressUpload, ProgressUploadSession, progress_notice};
pub use upload::UploadSession;

use ferry::{TransferError, TransferResult};

/// Tracks the target blob named by an upload stream.
///
/// The first message must carry a name; later messages may repeat it or
/// leave it empty.
#[derive(Debug, Default)]
struct TargetName {
    name: Option<String>,
}

impl TargetName {
    fn observe(&mut self, filename: &str) -> TransferResult<()> {
        match &self.name {
            None if filename.is_empty() => Err(TransferError::InvalidArgument(
                "first upload message must name the target file".to_string(),
            )),
            None => {
                ferry::store::validate_name(filename)?;
                self.name = Some(filename.to_string());
                Ok(())
            }
            Some(name) if filename.is_empty() || filename == name => Ok(()),
            Some(name) => Err(TransferError::InvalidArgument(format!(
                "target file changed mid-stream from {name:?} to {filename:?}"
            ))),
        }
    }

    fn into_name(self) -> TransferResult<String> {
        self.name.ok_or_else(|| {
            TransferError::InvalidArgument("upload stream ended before any data".to_string())
        })
    }
}
