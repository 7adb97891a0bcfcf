//! Chunk splitting and reassembly.
//!
//! Chunks carry no sequence number. Their order is whatever order the stream
//! delivers them in, so reassembly is plain concatenation.

use std::iter::FusedIterator;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{TransferError, TransferResult};

/// Split `payload` into chunks of `chunk_size` bytes.
///
/// Every chunk but the last is exactly `chunk_size` bytes long. The returned
/// iterator is lazy and cheap to clone, so a clone restarts the sequence.
pub fn split(payload: &[u8], chunk_size: usize) -> TransferResult<Chunks<'_>> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidArgument(
            "chunk size must be greater than zero".to_string(),
        ));
    }
    Ok(Chunks {
        remaining: payload,
        chunk_size,
    })
}

/// Iterator over the chunks of a payload, see [`split`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    remaining: &'a [u8],
    chunk_size: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let at = self.chunk_size.min(self.remaining.len());
        let (chunk, rest) = self.remaining.split_at(at);
        self.remaining = rest;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.len().div_ceil(self.chunk_size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks<'_> {}
impl FusedIterator for Chunks<'_> {}

/// Concatenate chunks in arrival order, stopping at the first upstream error.
pub fn reassemble<I, C, E>(chunks: I) -> Result<Vec<u8>, E>
where
    I: IntoIterator<Item = Result<C, E>>,
    C: AsRef<[u8]>,
{
    let mut buf = Reassembler::new();
    for chunk in chunks {
        buf.push(chunk?.as_ref());
    }
    Ok(buf.finish())
}

/// Incremental form of [`reassemble`] for chunks arriving one at a time.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    chunks: usize,
}

impl Reassembler {
    /// Create an empty reassembly buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next chunk. Returns the cumulative byte count.
    pub fn push(&mut self, chunk: &[u8]) -> u64 {
        self.buf.extend_from_slice(chunk);
        self.chunks += 1;
        self.buf.len() as u64
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Whether no bytes have been accumulated.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of chunks pushed so far, including empty ones.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// Take the reassembled payload.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads an async byte source in fixed-size chunks.
///
/// Short reads from the underlying source are coalesced, so chunk boundaries
/// match [`split`] over the same bytes.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    offset: u64,
    done: bool,
}

impl<R> std::fmt::Debug for ChunkReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkReader")
            .field("chunk_size", &self.chunk_size)
            .field("offset", &self.offset)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Wrap `reader` for chunked reading.
    pub fn new(reader: R, chunk_size: usize) -> TransferResult<Self> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidArgument(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            reader,
            chunk_size,
            offset: 0,
            done: false,
        })
    }

    /// Read the next chunk. Returns `None` at end of input.
    pub async fn next_chunk(&mut self) -> TransferResult<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        self.offset += filled as u64;
        Ok(Some(buf))
    }

    /// Bytes read so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}
