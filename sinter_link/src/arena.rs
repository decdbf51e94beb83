//! Bump arena for argument buffers.
//!
//! Buffers are carved out of large `BytesMut` chunks and handed out as
//! reference-counted `Bytes` views. A chunk is freed once every view into it
//! has been dropped, so releasing a command releases its buffers.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sinter_common::consts::MAX_ARG_BUFFER_LEN;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{LinkError, LinkResult};

/// Default chunk size carved by the arena [bytes].
pub const ARENA_CHUNK_SIZE: usize = 64 * 1024;

/// Immutable byte buffer sliced from an [`Arena`] chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ArenaBuf(Bytes);

impl ArenaBuf {
    /// Buffer not backed by any arena.
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Underlying shared bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl Deref for ArenaBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for ArenaBuf {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Thread-safe bump allocator.
#[derive(Debug)]
pub struct Arena {
    chunk: Mutex<BytesMut>,
    chunk_size: usize,
    allocations: AtomicU64,
    bytes_allocated: AtomicU64,
    chunks: AtomicU64,
}

impl Arena {
    /// Create an arena with the default chunk size.
    pub fn new() -> Self {
        Self::with_chunk_size(ARENA_CHUNK_SIZE)
    }

    /// Create an arena carving chunks of `chunk_size` bytes.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(MAX_ARG_BUFFER_LEN);
        Self {
            chunk: Mutex::new(BytesMut::with_capacity(chunk_size)),
            chunk_size,
            allocations: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            chunks: AtomicU64::new(1),
        }
    }

    /// Copy `data` into the arena.
    ///
    /// # Errors
    /// `LinkError::ArgumentTooLarge` if `data` does not fit the one-byte
    /// length prefix of the wire format.
    pub fn alloc(&self, data: &[u8]) -> LinkResult<ArenaBuf> {
        if data.len() > MAX_ARG_BUFFER_LEN {
            return Err(LinkError::ArgumentTooLarge {
                len: data.len(),
                max: MAX_ARG_BUFFER_LEN,
            });
        }
        if data.is_empty() {
            return Ok(ArenaBuf::empty());
        }
        let mut chunk = self.chunk.lock();
        if chunk.capacity() - chunk.len() < data.len() {
            *chunk = BytesMut::with_capacity(self.chunk_size);
            self.chunks.fetch_add(1, Ordering::Relaxed);
        }
        chunk.extend_from_slice(data);
        let view = chunk.split().freeze();
        drop(chunk);

        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(ArenaBuf(view))
    }

    /// Start a fresh chunk; the old one is freed once its views are gone.
    pub fn reset(&self) {
        *self.chunk.lock() = BytesMut::with_capacity(self.chunk_size);
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of successful allocations.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Total bytes handed out.
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Number of chunks carved so far.
    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
