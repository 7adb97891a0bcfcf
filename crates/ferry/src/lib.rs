//! Ferry: chunked blob transfer primitives
//!
//! The pieces every transfer session is built from, independent of the RPC
//! runtime that carries them:
//!
//! - [`codec`] splits payloads into fixed-size chunks and reassembles them
//! - [`store`] is the named-blob repository sessions read from and write to
//! - [`TransferError`] is the error vocabulary shared by server and client
//! - [`TransferConfig`] holds the knobs a session runs with

pub mod codec;
mod config;
mod error;
pub mod store;

pub use codec::{ChunkReader, Chunks, Reassembler, reassemble, split};
pub use config::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_CHUNK_SIZE, DEFAULT_PACE, TransferConfig};
pub use error::{TransferError, TransferResult};
pub use store::{BlobReader, LocalDirStore, MemoryStore, StoreError, TransferStore};
