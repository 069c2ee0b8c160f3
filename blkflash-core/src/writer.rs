//! The positional, coalescing sink at the end of the write pipeline.
//!
//! Chunks are collected into a [`WriteBatch`] for as long as they are
//! contiguous, and each batch goes to the target as one vectored positional
//! write. Chunks without an offset are placed right after the previous one,
//! so the same writer serves both plain sequential images and sparse,
//! block-map driven writes.
use crate::chunk::Chunk;
use crate::descriptor::{CloseOutcome, Descriptor, DescriptorOptions};
use crate::error::{FlashError, Result};
use bytes::Bytes;
use std::io;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Batches are flushed once they hold at least this many bytes.
pub const COALESCE_THRESHOLD: usize = 64 * 1024;

/// A batch taken out of a [`WriteBatch`], ready to be written.
#[derive(Debug)]
pub struct FlushRequest {
    pub offset: u64,
    pub buffers: Vec<Bytes>,
    pub length: u64,
}

/// An accumulator of contiguous chunks.
#[derive(Debug, Default)]
pub struct WriteBatch {
    chunks: Vec<Bytes>,
    start_offset: u64,
    total_length: u64,
    last_position: u64,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch whose first sequential chunk lands at `position`.
    pub fn starting_at(position: u64) -> Self {
        Self {
            last_position: position,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Position right after the last accepted chunk.
    pub fn last_position(&self) -> u64 {
        self.last_position
    }

    /// Adds `chunk` to the batch.
    ///
    /// If the chunk does not continue the batch, or the batch has already
    /// reached `threshold` bytes, the current contents are returned for
    /// flushing and the chunk starts a new batch.
    pub fn push(&mut self, chunk: Chunk, threshold: usize) -> Option<FlushRequest> {
        let offset = chunk.offset.unwrap_or(self.last_position);
        let flush = if !self.chunks.is_empty()
            && (offset != self.last_position || self.total_length >= threshold as u64)
        {
            self.take()
        } else {
            None
        };

        if self.chunks.is_empty() {
            self.start_offset = offset;
        }
        self.total_length += chunk.data.len() as u64;
        self.last_position = offset + chunk.data.len() as u64;
        self.chunks.push(chunk.data);
        flush
    }

    /// Empties the batch. The sequential position is kept.
    pub fn take(&mut self) -> Option<FlushRequest> {
        if self.chunks.is_empty() {
            return None;
        }
        let request = FlushRequest {
            offset: self.start_offset,
            buffers: std::mem::take(&mut self.chunks),
            length: self.total_length,
        };
        self.total_length = 0;
        Some(request)
    }
}

/// Counters kept by a [`CoalescingWriter`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Bytes accepted from upstream.
    pub bytes_read: u64,
    /// Chunks accepted from upstream.
    pub blocks_read: u64,
    /// Bytes confirmed by the target.
    pub bytes_written: u64,
    /// Chunks confirmed by the target.
    pub blocks_written: u64,
    /// Vectored write calls issued.
    pub flushes: u64,
    /// End of the furthest confirmed write.
    pub high_water: u64,
}

type CloseNotifier = Box<dyn FnOnce() + Send>;

/// Writes chunks to a descriptor, coalescing contiguous ones.
///
/// Chunk offsets are relative to the start of the writer's range, which is
/// the beginning of the target unless set with [`CoalescingWriter::with_range`].
pub struct CoalescingWriter {
    descriptor: Descriptor,
    auto_close: bool,
    threshold: usize,
    start: u64,
    end: Option<u64>,
    batch: WriteBatch,
    stats: WriterStats,
    destroyed: bool,
    on_close: Option<CloseNotifier>,
}

impl CoalescingWriter {
    pub fn new(descriptor: Descriptor, auto_close: bool) -> Self {
        Self {
            descriptor,
            auto_close,
            threshold: COALESCE_THRESHOLD,
            start: 0,
            end: None,
            batch: WriteBatch::new(),
            stats: WriterStats::default(),
            destroyed: false,
            on_close: None,
        }
    }

    /// Starts opening the target and returns a writer for its range.
    pub fn open(options: &DescriptorOptions) -> Self {
        Self::new(Descriptor::open(options), options.auto_close)
            .with_range(options.start, options.end)
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Confines writes to `[start, end)` of the target. Writes reaching past
    /// `end` fail.
    pub fn with_range(mut self, start: u64, end: Option<u64>) -> Self {
        self.start = start;
        self.end = end;
        self.batch = WriteBatch::starting_at(start);
        self
    }

    /// Registers a callback run once, when the descriptor is closed.
    pub fn on_close(mut self, notify: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(notify));
        self
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    pub fn bytes_written(&self) -> u64 {
        self.stats.bytes_written
    }

    /// Accepts one chunk. May flush the previous batch first.
    pub async fn write(&mut self, mut chunk: Chunk) -> Result<()> {
        if self.destroyed {
            return Err(FlashError::write(
                chunk.offset.unwrap_or(self.batch.last_position()),
                io::Error::new(io::ErrorKind::NotConnected, "writer destroyed"),
            ));
        }

        chunk.offset = chunk.offset.map(|offset| self.start + offset);
        self.stats.blocks_read += 1;
        self.stats.bytes_read += chunk.data.len() as u64;
        trace!(len = chunk.len(), offset = ?chunk.offset, "write chunk");

        if let Some(request) = self.batch.push(chunk, self.threshold) {
            self.flush_request(request).await?;
        }
        Ok(())
    }

    /// Writes out whatever is queued.
    pub async fn flush(&mut self) -> Result<()> {
        match self.batch.take() {
            Some(request) => self.flush_request(request).await,
            None => Ok(()),
        }
    }

    async fn flush_request(&mut self, request: FlushRequest) -> Result<()> {
        let count = request.buffers.len() as u64;
        debug!(
            offset = request.offset,
            length = request.length,
            buffers = count,
            "flush batch"
        );

        if let Some(end) = self.end {
            if request.offset + request.length > end {
                let error = FlashError::write(
                    request.offset,
                    io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!(
                            "write of {} bytes runs past the end of the target at {end}",
                            request.length
                        ),
                    ),
                );
                return Err(self.fail(error).await);
            }
        }

        let result = self
            .descriptor
            .write_vectored_at(request.offset, request.buffers)
            .await;

        let written = match result {
            Ok(written) => written,
            Err(e) => return Err(self.fail(e).await),
        };

        self.stats.bytes_written += written;
        self.stats.blocks_written += count;
        self.stats.flushes += 1;
        self.stats.high_water = self.stats.high_water.max(request.offset + written);

        if written != request.length {
            let error = FlashError::short_write(request.offset, request.length, written);
            return Err(self.fail(error).await);
        }
        Ok(())
    }

    async fn fail(&mut self, error: FlashError) -> FlashError {
        if self.auto_close {
            if let Err(close_error) = self.destroy().await {
                warn!(error = %close_error, "failed to close target after write error");
            }
        }
        error
    }

    /// Ends the stream: flushes, syncs, and checks that every accepted byte
    /// was confirmed.
    pub async fn finish(&mut self) -> Result<()> {
        self.flush().await?;
        if let Err(e) = self.descriptor.sync().await {
            return Err(self.fail(e).await);
        }

        if self.stats.bytes_read != self.stats.bytes_written {
            let error = FlashError::short_write(
                self.stats.high_water,
                self.stats.bytes_read,
                self.stats.bytes_written,
            );
            return Err(self.fail(error).await);
        }

        debug!(stats = ?self.stats, "writer finished");
        if self.auto_close {
            self.close().await?;
        }
        Ok(())
    }

    /// Closes the target. Idempotent; waits for a pending open.
    pub async fn close(&mut self) -> Result<CloseOutcome> {
        let outcome = self.descriptor.close().await?;
        if outcome == CloseOutcome::Closed {
            if let Some(notify) = self.on_close.take() {
                notify();
            }
        }
        Ok(outcome)
    }

    /// Stops accepting chunks and closes the target.
    pub async fn destroy(&mut self) -> Result<CloseOutcome> {
        self.destroyed = true;
        self.close().await
    }

    /// Gives up ownership of the still-open target, e.g. for a verify pass.
    pub(crate) fn take_descriptor(&mut self) -> Option<Descriptor> {
        self.descriptor.take()
    }

    /// Drains `input` into the target.
    ///
    /// A torn-down pass destroys the writer instead of finishing it, so a
    /// partial stream is never reported as complete.
    pub(crate) async fn run(
        &mut self,
        mut input: mpsc::Receiver<Chunk>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let result = self.consume(&mut input, &cancel).await;
        if let Err(e) = &result {
            cancel.cancel();
            if e.is_aborted() {
                if let Err(close_error) = self.destroy().await {
                    warn!(error = %close_error, "failed to close target after abort");
                }
            }
        }
        result
    }

    async fn consume(
        &mut self,
        input: &mut mpsc::Receiver<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while let Some(chunk) = input.recv().await {
            if cancel.is_cancelled() {
                return Err(FlashError::Aborted);
            }
            self.write(chunk).await?;
        }
        if cancel.is_cancelled() {
            return Err(FlashError::Aborted);
        }
        self.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::OpenFlags;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    fn target(temp: &NamedTempFile) -> DescriptorOptions {
        DescriptorOptions::path(temp.path())
            .flags(OpenFlags::read_write())
            .auto_close(false)
    }

    #[test]
    fn test_batch_coalesces_contiguous_chunks() {
        let mut batch = WriteBatch::new();
        for i in 0..4u64 {
            assert!(batch.push(Chunk::at(i * 512, vec![0u8; 512]), COALESCE_THRESHOLD).is_none());
        }
        let request = batch.take().unwrap();
        assert_eq!(request.offset, 0);
        assert_eq!(request.buffers.len(), 4);
        assert_eq!(request.length, 2048);
    }

    #[test]
    fn test_batch_flushes_on_gap() {
        let mut batch = WriteBatch::new();
        assert!(batch.push(Chunk::at(0, vec![0u8; 512]), COALESCE_THRESHOLD).is_none());
        let flushed = batch.push(Chunk::at(4096, vec![0u8; 512]), COALESCE_THRESHOLD).unwrap();

        assert_eq!(flushed.offset, 0);
        assert_eq!(flushed.length, 512);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.last_position(), 4608);
    }

    #[test]
    fn test_batch_flushes_at_threshold() {
        let mut batch = WriteBatch::new();
        assert!(batch.push(Chunk::new(vec![0u8; 1024]), 1024).is_none());
        let flushed = batch.push(Chunk::new(vec![0u8; 512]), 1024).unwrap();
        assert_eq!(flushed.length, 1024);
        assert_eq!(batch.total_length(), 512);
    }

    #[test]
    fn test_sequential_chunks_follow_last_position() {
        let mut batch = WriteBatch::new();
        batch.push(Chunk::at(1024, vec![0u8; 512]), COALESCE_THRESHOLD);
        batch.push(Chunk::new(vec![0u8; 512]), COALESCE_THRESHOLD);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.last_position(), 2048);
    }

    #[tokio::test]
    async fn test_contiguous_chunks_are_one_write() {
        let temp = NamedTempFile::new().unwrap();
        let mut writer = CoalescingWriter::open(&target(&temp));

        for i in 0..8u64 {
            writer
                .write(Chunk::at(i * 512, vec![i as u8 + 1; 512]))
                .await
                .unwrap();
        }
        writer.finish().await.unwrap();

        let stats = writer.stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.blocks_read, 8);
        assert_eq!(stats.blocks_written, 8);
        assert_eq!(stats.bytes_written, 4096);

        let contents = std::fs::read(temp.path()).unwrap();
        assert_eq!(contents.len(), 4096);
        assert!(contents[3584..].iter().all(|&b| b == 8));
    }

    #[tokio::test]
    async fn test_gap_forces_flush_and_leaves_hole_untouched() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), vec![0xEEu8; 4096]).unwrap();
        let mut writer = CoalescingWriter::open(&target(&temp));

        writer.write(Chunk::at(0, vec![1u8; 512])).await.unwrap();
        writer.write(Chunk::at(2048, vec![2u8; 512])).await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(writer.stats().flushes, 2);
        let contents = std::fs::read(temp.path()).unwrap();
        assert!(contents[..512].iter().all(|&b| b == 1));
        assert!(contents[512..2048].iter().all(|&b| b == 0xEE));
        assert!(contents[2048..2560].iter().all(|&b| b == 2));
        assert!(contents[2560..].iter().all(|&b| b == 0xEE));
    }

    #[tokio::test]
    async fn test_range_shifts_every_write() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), vec![0xEEu8; 4096]).unwrap();
        let mut writer = CoalescingWriter::open(&target(&temp).range(1024, None));

        writer.write(Chunk::new(vec![1u8; 512])).await.unwrap();
        writer.write(Chunk::at(2048, vec![2u8; 512])).await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(writer.stats().high_water, 3584);
        let contents = std::fs::read(temp.path()).unwrap();
        assert!(contents[..1024].iter().all(|&b| b == 0xEE));
        assert!(contents[1024..1536].iter().all(|&b| b == 1));
        assert!(contents[1536..3072].iter().all(|&b| b == 0xEE));
        assert!(contents[3072..3584].iter().all(|&b| b == 2));
    }

    #[tokio::test]
    async fn test_write_past_range_end_fails() {
        let temp = NamedTempFile::new().unwrap();
        let mut writer = CoalescingWriter::open(&target(&temp).range(512, Some(1536)));

        writer.write(Chunk::new(vec![1u8; 1024])).await.unwrap();
        writer.write(Chunk::new(vec![2u8; 512])).await.unwrap();
        let err = writer.finish().await.unwrap_err();
        assert!(matches!(err, FlashError::Write { offset: 512, .. }));
        assert_eq!(writer.stats().bytes_written, 0);
    }

    #[tokio::test]
    async fn test_close_notifies_once() {
        let temp = NamedTempFile::new().unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let mut writer = CoalescingWriter::open(&target(&temp)).on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(writer.close().await.unwrap(), CloseOutcome::Closed);
        assert_eq!(writer.destroy().await.unwrap(), CloseOutcome::AlreadyClosed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_after_destroy_fails() {
        let temp = NamedTempFile::new().unwrap();
        let mut writer = CoalescingWriter::open(&target(&temp));
        writer.destroy().await.unwrap();

        let err = writer.write(Chunk::new(vec![0u8; 512])).await.unwrap_err();
        assert!(matches!(err, FlashError::Write { .. }));
    }

    #[tokio::test]
    async fn test_run_destroys_on_abort() {
        let temp = NamedTempFile::new().unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let mut writer = CoalescingWriter::open(&target(&temp)).on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        tx.send(Chunk::new(vec![1u8; 512])).await.unwrap();
        cancel.cancel();
        drop(tx);

        let err = writer.run(rx, cancel).await.unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(writer.stats().bytes_written, 0);
    }
}
