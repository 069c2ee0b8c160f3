//! The first stage of a pass: where chunks come from.
use crate::chunk::Chunk;
use crate::error::{FlashError, Result};
use crate::reader::ChunkedReader;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Size of each read from an image stream.
pub const STREAM_READ_SIZE: usize = 64 * 1024;

/// Reads an image from any byte stream.
pub struct StreamSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    read_size: usize,
    bytes_read: u64,
    done: bool,
}

impl StreamSource {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::from_boxed(Box::new(reader))
    }

    pub fn from_boxed(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            reader,
            read_size: STREAM_READ_SIZE,
            bytes_read: 0,
            done: false,
        }
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size.max(1);
        self
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Returns the next non-empty chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }
        let mut buffer = BytesMut::with_capacity(self.read_size);
        let read = match self.reader.read_buf(&mut buffer).await {
            Ok(read) => read,
            Err(e) => {
                self.done = true;
                return Err(FlashError::read(self.bytes_read, e));
            }
        };
        if read == 0 {
            self.done = true;
            return Ok(None);
        }
        self.bytes_read += read as u64;
        Ok(Some(Chunk::new(buffer.freeze())))
    }

    fn destroy(&mut self) {
        self.done = true;
    }
}

/// The producer of a pass.
pub(crate) enum Source {
    /// The image being written.
    Stream(StreamSource),
    /// The target, read back for verification.
    Target(ChunkedReader),
}

impl Source {
    pub(crate) fn bytes_read(&self) -> u64 {
        match self {
            Source::Stream(stream) => stream.bytes_read(),
            Source::Target(reader) => reader.bytes_read(),
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        match self {
            Source::Stream(stream) => stream.next_chunk().await,
            Source::Target(reader) => reader.next_chunk().await,
        }
    }

    async fn destroy(&mut self) {
        match self {
            Source::Stream(stream) => stream.destroy(),
            Source::Target(reader) => {
                if let Err(e) = reader.destroy().await {
                    warn!(error = %e, "failed to close source");
                }
            }
        }
    }

    /// Pushes every chunk into `output` until the source runs dry.
    ///
    /// Cancellation destroys the source and ends the pass with
    /// [`FlashError::Aborted`]. A read failure cancels the pass so the
    /// downstream stages tear down instead of finishing a truncated stream.
    pub(crate) async fn run(
        &mut self,
        output: mpsc::Sender<Chunk>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.abort().await),
                next = self.next_chunk() => next,
            };

            let chunk = match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    debug!(bytes_read = self.bytes_read(), "source exhausted");
                    return Ok(());
                }
                Err(e) => {
                    cancel.cancel();
                    return Err(e);
                }
            };

            trace!(len = chunk.len(), "source chunk");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.abort().await),
                sent = output.send(chunk) => {
                    // The consumer is gone; it reports its own failure.
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn abort(&mut self) -> FlashError {
        debug!(bytes_read = self.bytes_read(), "source aborted");
        self.destroy().await;
        FlashError::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_source_counts_bytes() {
        let data = vec![5u8; 150 * 1024];
        let mut source = StreamSource::new(std::io::Cursor::new(data));

        let mut total = 0;
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            assert!(chunk.len() <= STREAM_READ_SIZE);
            assert!(chunk.offset.is_none());
            total += chunk.len();
        }
        assert_eq!(total, 150 * 1024);
        assert_eq!(source.bytes_read(), 150 * 1024);
    }

    #[tokio::test]
    async fn test_run_forwards_everything() {
        let mut source = Source::Stream(StreamSource::new(std::io::Cursor::new(vec![1u8; 4000])));
        let (tx, mut rx) = mpsc::channel(8);

        source.run(tx, CancellationToken::new()).await.unwrap();
        let mut total = 0;
        while let Some(chunk) = rx.recv().await {
            total += chunk.len();
        }
        assert_eq!(total, 4000);
    }

    #[tokio::test]
    async fn test_run_aborts_when_cancelled() {
        let mut source = Source::Stream(StreamSource::new(std::io::Cursor::new(vec![1u8; 4000])));
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = source.run(tx, cancel).await.unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(source.bytes_read(), 0);
    }
}
