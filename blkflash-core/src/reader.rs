//! Bounded, sequential reads from a descriptor.
use crate::chunk::Chunk;
use crate::descriptor::{CloseOutcome, Descriptor, DescriptorOptions};
use crate::error::Result;
use tracing::{debug, trace, warn};

/// Smallest read issued, even when fewer bytes remain before `end`.
pub const MIN_READ_SIZE: usize = 512;
/// Largest read issued.
pub const MAX_READ_SIZE: usize = 64 * 1024;

type CloseNotifier = Box<dyn FnOnce() + Send>;

/// Reads `[start, end)` of a descriptor as a finite sequence of chunks.
///
/// Each step reads `clamp(end - position, 512, 64 KiB)` bytes, so the range
/// must be a multiple of 512 bytes (as every range written by the pipeline
/// is); otherwise the last read comes up short and fails.
pub struct ChunkedReader {
    descriptor: Descriptor,
    position: u64,
    end: u64,
    auto_close: bool,
    bytes_read: u64,
    done: bool,
    on_close: Option<CloseNotifier>,
}

impl ChunkedReader {
    pub fn new(descriptor: Descriptor, start: u64, end: u64, auto_close: bool) -> Self {
        Self {
            descriptor,
            position: start,
            end,
            auto_close,
            bytes_read: 0,
            done: false,
            on_close: None,
        }
    }

    /// Starts opening the descriptor and returns a reader over
    /// `[options.start, options.end)`. Without an end, reading continues
    /// until the descriptor runs out, which surfaces as a short read.
    pub fn open(options: &DescriptorOptions) -> Self {
        Self::new(
            Descriptor::open(options),
            options.start,
            options.end.unwrap_or(u64::MAX),
            options.auto_close,
        )
    }

    /// Registers a callback run once, when the descriptor is closed.
    pub fn on_close(mut self, notify: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(notify));
        self
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Bytes actually read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reads the next chunk, or returns `None` once `end` is reached.
    ///
    /// After an error or the end of the range, no further reads are issued.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }

        let remaining = self.end.saturating_sub(self.position);
        if remaining == 0 {
            self.done = true;
            debug!(bytes_read = self.bytes_read, "reader reached end");
            if self.auto_close {
                self.close().await?;
            }
            return Ok(None);
        }

        let length = remaining.clamp(MIN_READ_SIZE as u64, MAX_READ_SIZE as u64) as usize;
        let offset = self.position;
        self.position += length as u64;

        match self.descriptor.read_at(offset, length).await {
            Ok(data) => {
                trace!(offset, length, "read chunk");
                self.bytes_read += data.len() as u64;
                Ok(Some(Chunk::at(offset, data)))
            }
            Err(e) => {
                self.done = true;
                if self.auto_close {
                    if let Err(close_error) = self.close().await {
                        warn!(error = %close_error, "failed to close source after read error");
                    }
                }
                Err(e)
            }
        }
    }

    /// Closes the descriptor. Idempotent; waits for a pending open.
    pub async fn close(&mut self) -> Result<CloseOutcome> {
        let outcome = self.descriptor.close().await?;
        if outcome == CloseOutcome::Closed {
            if let Some(notify) = self.on_close.take() {
                notify();
            }
        }
        Ok(outcome)
    }

    /// Stops reading and closes the descriptor.
    pub async fn destroy(&mut self) -> Result<CloseOutcome> {
        self.done = true;
        self.close().await
    }

    /// Returns the descriptor to its owner, open or not.
    pub(crate) fn into_descriptor(self) -> Descriptor {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlashError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    fn image(len: usize) -> NamedTempFile {
        let temp = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        std::fs::write(temp.path(), data).unwrap();
        temp
    }

    async fn drain(reader: &mut ChunkedReader) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_reads_exactly_the_range() {
        let temp = image(300 * 1024);
        let end = 200 * 1024 + 512;
        let mut reader = ChunkedReader::open(
            &DescriptorOptions::path(temp.path()).range(0, Some(end)),
        );

        let chunks = drain(&mut reader).await;
        let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        assert_eq!(total, end);
        assert_eq!(reader.bytes_read(), end);
        assert!(chunks.iter().all(|c| c.len() <= MAX_READ_SIZE));
        assert_eq!(chunks.last().unwrap().len(), 512);
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_starts_at_offset() {
        let temp = image(8192);
        let mut reader = ChunkedReader::open(
            &DescriptorOptions::path(temp.path()).range(1024, Some(4096)),
        );

        let chunks = drain(&mut reader).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, Some(1024));
        assert_eq!(chunks[0].len(), 3072);
        assert_eq!(chunks[0].data[0], (1024 % 253) as u8);
    }

    #[tokio::test]
    async fn test_empty_range_ends_immediately() {
        let temp = image(1024);
        let mut reader =
            ChunkedReader::open(&DescriptorOptions::path(temp.path()).range(512, Some(512)));
        assert!(reader.next_chunk().await.unwrap().is_none());
        assert_eq!(reader.bytes_read(), 0);
    }

    #[tokio::test]
    async fn test_short_read_fails_and_closes() {
        let temp = image(100);
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let mut reader = ChunkedReader::open(
            &DescriptorOptions::path(temp.path()).range(0, Some(100)),
        )
        .on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Fewer than 512 bytes remain, so 512 are requested and only 100 exist.
        let err = reader.next_chunk().await.unwrap_err();
        assert!(matches!(err, FlashError::Read { offset: 0, .. }));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let temp = image(1024);
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let mut reader = ChunkedReader::open(&DescriptorOptions::path(temp.path()))
            .on_close(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        // Closed before anything awaited the open.
        assert_eq!(reader.close().await.unwrap(), CloseOutcome::Closed);
        assert_eq!(reader.close().await.unwrap(), CloseOutcome::AlreadyClosed);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = ChunkedReader::open(
            &DescriptorOptions::path(dir.path().join("nope")).range(0, Some(512)),
        );
        let err = reader.next_chunk().await.unwrap_err();
        assert!(matches!(err, FlashError::Open { .. }));
        assert!(reader.next_chunk().await.unwrap().is_none());
    }
}
