//! Per-call deadlines from the `grpc-timeout` metadata entry.

use std::time::Duration;

use tokio::time::Instant;
use tonic::metadata::MetadataMap;

/// Metadata key carrying the caller's timeout.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Parse a `grpc-timeout` value: up to eight digits followed by a unit
/// (`H`, `M`, `S`, `m`, `u` or `n`).
pub fn parse_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

/// Deadline for the call carrying `metadata`, measured from now.
///
/// Malformed values are ignored rather than failing the call.
pub fn from_metadata(metadata: &MetadataMap) -> Option<Instant> {
    let raw = metadata.get(GRPC_TIMEOUT_HEADER)?;
    let Some(timeout) = raw.to_str().ok().and_then(parse_timeout) else {
        tracing::warn!(value = ?raw, "ignoring malformed grpc-timeout");
        return None;
    };
    Some(Instant::now() + timeout)
}
