//! Re-chunks an arbitrary byte stream into block-aligned chunks.
use crate::chunk::Chunk;
use crate::error::Result;
use crate::transform::Transform;
use bytes::{Bytes, BytesMut};

/// Default alignment unit for target writes.
pub const DEFAULT_BLOCK_SIZE: usize = 512;
/// Default size at which accumulated data is emitted.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Turns incoming chunks of any size into chunks whose length is a positive
/// multiple of `block_size`.
///
/// Data is accumulated until at least `chunk_size` bytes are pending, then
/// the largest block-aligned prefix is emitted and the remainder carried
/// over. At end of stream the remainder is zero-padded to a full block.
/// Chunks that are already large and aligned bypass the accumulator without
/// being copied.
///
/// Offsets are not tracked; output chunks are always sequential.
#[derive(Debug)]
pub struct BlockAligner {
    block_size: usize,
    chunk_size: usize,
    pending: Vec<Bytes>,
    pending_len: usize,
    bytes_read: u64,
    bytes_written: u64,
}

impl BlockAligner {
    /// # Panics
    ///
    /// Panics if `block_size` is zero. [`FlashOptions::validate`] rejects
    /// such a size before a pass builds its aligner.
    ///
    /// [`FlashOptions::validate`]: crate::options::FlashOptions::validate
    pub fn new(block_size: usize, chunk_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            block_size,
            chunk_size,
            pending: Vec::new(),
            pending_len: 0,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes accepted from upstream.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Bytes emitted downstream, including padding.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn emit(&mut self, data: Bytes, out: &mut Vec<Chunk>) {
        self.bytes_written += data.len() as u64;
        out.push(Chunk::new(data));
    }

    fn take_pending(&mut self, padded_len: usize) -> BytesMut {
        let mut block = BytesMut::with_capacity(padded_len.max(self.pending_len));
        for buffer in self.pending.drain(..) {
            block.extend_from_slice(&buffer);
        }
        self.pending_len = 0;
        block
    }
}

impl Default for BlockAligner {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE)
    }
}

impl Transform for BlockAligner {
    fn name(&self) -> &'static str {
        "block-aligner"
    }

    fn push(&mut self, chunk: Chunk, out: &mut Vec<Chunk>) -> Result<()> {
        let len = chunk.len();
        self.bytes_read += len as u64;
        if len == 0 {
            return Ok(());
        }

        if self.pending_len == 0 && len >= self.chunk_size && len % self.block_size == 0 {
            self.emit(chunk.data, out);
            return Ok(());
        }

        self.pending.push(chunk.data);
        self.pending_len += len;

        if self.pending_len >= self.chunk_size {
            let mut block = self.take_pending(0);
            let aligned = block.len() / self.block_size * self.block_size;
            let remainder = block.split_off(aligned);
            if !remainder.is_empty() {
                self.pending_len = remainder.len();
                self.pending.push(remainder.freeze());
            }
            if aligned > 0 {
                self.emit(block.freeze(), out);
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<Chunk>) -> Result<()> {
        if self.pending_len == 0 {
            return Ok(());
        }
        let padded = self.pending_len.div_ceil(self.block_size) * self.block_size;
        let mut block = self.take_pending(padded);
        block.resize(padded, 0);
        self.emit(block.freeze(), out);
        Ok(())
    }
}
