//! Error types shared by every stage of the flashing pipeline.
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// The error surfaced by a failed pass.
///
/// Each variant identifies the kind of failure so that front-ends can tell an
/// unreadable image from a failing device or a verification mismatch. I/O
/// sources are reference counted so the error can be both reported as an
/// event and returned to the caller.
#[derive(Clone, Debug, Error)]
pub enum FlashError {
    /// The descriptor could not be opened.
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// A read failed, including a short read.
    #[error("read failed at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: Arc<io::Error>,
    },

    /// A write failed, including a confirmed-bytes mismatch.
    #[error("write failed at offset {offset}: {source}")]
    Write {
        offset: u64,
        #[source]
        source: Arc<io::Error>,
    },

    /// The data read back from the target does not match what was written.
    #[error("verification failed: {algorithm} mismatch (expected {expected}, got {actual})")]
    VerifyMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// A pipeline transform (checksum, decompression, block map filter) failed.
    #[error("{stage} stage failed: {message}")]
    Stage { stage: &'static str, message: String },

    /// The operation was aborted before it completed.
    #[error("operation aborted")]
    Aborted,

    /// The options passed to the pipeline are not usable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Removable devices could not be listed.
    #[error("device discovery failed: {0}")]
    Discovery(String),
}

impl FlashError {
    pub(crate) fn open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FlashError::Open {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn read(offset: u64, source: io::Error) -> Self {
        FlashError::Read {
            offset,
            source: Arc::new(source),
        }
    }

    pub(crate) fn write(offset: u64, source: io::Error) -> Self {
        FlashError::Write {
            offset,
            source: Arc::new(source),
        }
    }

    pub(crate) fn short_read(offset: u64, requested: usize, actual: usize) -> Self {
        FlashError::read(
            offset,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("bytes read mismatch: {actual} != {requested}"),
            ),
        )
    }

    pub(crate) fn short_write(offset: u64, requested: u64, actual: u64) -> Self {
        FlashError::write(
            offset,
            io::Error::new(
                io::ErrorKind::WriteZero,
                format!("bytes written mismatch: {actual} != {requested}"),
            ),
        )
    }

    pub(crate) fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        FlashError::Stage {
            stage,
            message: message.into(),
        }
    }

    /// Returns `true` if this error was caused by an abort request.
    pub fn is_aborted(&self) -> bool {
        matches!(self, FlashError::Aborted)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlashError>;
