//! Transfer configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TransferError, TransferResult};

/// Chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 5;
/// Delay between streamed chunks when none is configured.
pub const DEFAULT_PACE: Duration = Duration::from_secs(1);
/// Buffered messages per outbound stream when none is configured.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// Knobs a transfer session runs with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per chunk on outbound streams
    pub chunk_size: usize,
    /// Delay between consecutive outbound chunks; zero disables pacing
    #[serde(with = "duration_ms", rename = "pace_ms")]
    pub pace: Duration,
    /// Buffered messages per outbound stream
    pub channel_capacity: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pace: DEFAULT_PACE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl TransferConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> TransferResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TransferError::InvalidArgument(format!("{}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            TransferError::InvalidArgument(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can drive a session.
    pub fn validate(&self) -> TransferResult<()> {
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidArgument(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(TransferError::InvalidArgument(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Same configuration without artificial pacing.
    pub fn unpaced(self) -> Self {
        Self {
            pace: Duration::ZERO,
            ..self
        }
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
