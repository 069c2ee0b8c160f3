//! Asynchronous handles to raw targets (image files and block devices).
//!
//! A [`Descriptor`] starts opening its target as soon as it is constructed and
//! sits in a pending state until that open completes. Every read, write or
//! close issued in the meantime simply waits for the open, so callers never
//! have to sequence "open, then use" themselves.
//!
//! All I/O is positional (`pread`/`pwritev`) and runs on tokio's blocking
//! pool, keeping the pipeline tasks free to make progress.
use crate::error::{FlashError, Result};
use crate::os_options;
use bytes::Bytes;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, trace};

/// What a descriptor refers to.
#[derive(Clone, Debug)]
pub enum Target {
    /// A path to open lazily.
    Path(PathBuf),
    /// An already-open file. Closing the descriptor releases this reference.
    File(Arc<File>),
}

/// Access flags used when opening a [`Target::Path`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    /// Raw `open(2)` flags such as `O_SYNC` or `O_DIRECT`. Unix only.
    pub custom: i32,
}

impl OpenFlags {
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
            custom: 0,
        }
    }

    /// Read and write without creating or truncating; the usual mode for
    /// block devices, which are written and then read back for verification.
    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            create: false,
            truncate: false,
            custom: 0,
        }
    }

    /// Like [`OpenFlags::read_write`] but creates the target if it does not
    /// exist. Useful when flashing to a regular file.
    pub const fn create() -> Self {
        Self {
            create: true,
            ..Self::read_write()
        }
    }

    pub const fn with_custom(mut self, custom: i32) -> Self {
        self.custom = custom;
        self
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::read_write()
    }
}

/// Everything needed to open and bound a descriptor.
#[derive(Clone, Debug)]
pub struct DescriptorOptions {
    pub target: Target,
    pub flags: OpenFlags,
    /// Permission bits used when the target is created.
    pub mode: u32,
    /// Close the descriptor when the owning stage finishes or fails.
    pub auto_close: bool,
    /// Byte range of the target used by the pipeline. Writes are placed
    /// relative to `start` and must not reach past `end`.
    pub start: u64,
    pub end: Option<u64>,
}

impl DescriptorOptions {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Target::Path(path.into()),
            flags: OpenFlags::default(),
            mode: 0o666,
            auto_close: true,
            start: 0,
            end: None,
        }
    }

    pub fn file(file: Arc<File>) -> Self {
        Self {
            target: Target::File(file),
            ..Self::path(PathBuf::new())
        }
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub fn range(mut self, start: u64, end: Option<u64>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// A human-readable name for log and error messages.
    pub fn display_path(&self) -> PathBuf {
        match &self.target {
            Target::Path(path) => path.clone(),
            Target::File(_) => PathBuf::from("<descriptor>"),
        }
    }
}

/// Result of a [`Descriptor::close`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call released the descriptor.
    Closed,
    /// The descriptor had already been closed by an earlier call.
    AlreadyClosed,
}

enum State {
    PendingOpen(JoinHandle<io::Result<File>>),
    Open(Arc<File>),
    Closed,
}

/// An open (or opening) target.
pub struct Descriptor {
    path: PathBuf,
    state: State,
}

impl Descriptor {
    /// Starts opening the target described by `options`.
    ///
    /// The open is issued once, right away, on the blocking pool. Must be
    /// called from within a tokio runtime.
    pub fn open(options: &DescriptorOptions) -> Self {
        let path = options.display_path();
        let state = match &options.target {
            Target::File(file) => State::Open(file.clone()),
            Target::Path(target) => {
                let target = target.clone();
                let open_options = os_options::open_options(&options.flags, options.mode);
                debug!(path = %target.display(), flags = ?options.flags, "opening descriptor");
                State::PendingOpen(task::spawn_blocking(move || open_options.open(target)))
            }
        };
        Self { path, state }
    }

    /// Wraps a file that is already open.
    pub fn from_file(file: Arc<File>) -> Self {
        Self {
            path: PathBuf::from("<descriptor>"),
            state: State::Open(file),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Returns the open file, waiting for a pending open first.
    ///
    /// A failed open moves the descriptor to the closed state, so the error is
    /// reported once and later operations fail without retrying the open.
    pub async fn file(&mut self) -> Result<Arc<File>> {
        match &mut self.state {
            State::Open(file) => Ok(file.clone()),
            State::Closed => Err(FlashError::open(
                self.path.clone(),
                io::Error::new(io::ErrorKind::NotConnected, "descriptor is closed"),
            )),
            State::PendingOpen(handle) => {
                let opened = handle.await.unwrap_or_else(|e| Err(io::Error::other(e)));
                match opened {
                    Ok(file) => {
                        debug!(path = %self.path.display(), "descriptor open");
                        let file = Arc::new(file);
                        self.state = State::Open(file.clone());
                        Ok(file)
                    }
                    Err(source) => {
                        self.state = State::Closed;
                        Err(FlashError::open(self.path.clone(), source))
                    }
                }
            }
        }
    }

    /// Reads exactly `len` bytes at `offset`.
    ///
    /// A short read is an error: the pipeline only ever reads ranges it knows
    /// to exist, so fewer bytes means the target is smaller than expected.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        let file = self.file().await?;
        let (buffer, read) = task::spawn_blocking(move || {
            let mut buffer = vec![0u8; len];
            let read = pread(&file, &mut buffer, offset)?;
            Ok::<_, io::Error>((buffer, read))
        })
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)))
        .map_err(|source| FlashError::read(offset, source))?;

        trace!(offset, len, read, "pread");
        if read != len {
            return Err(FlashError::short_read(offset, len, read));
        }
        Ok(Bytes::from(buffer))
    }

    /// Writes `buffers` back to back starting at `offset` in a single
    /// vectored call and returns the number of bytes the OS confirmed.
    pub async fn write_vectored_at(&mut self, offset: u64, buffers: Vec<Bytes>) -> Result<u64> {
        let file = self.file().await?;
        let written = task::spawn_blocking(move || pwritev(&file, &buffers, offset))
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)))
            .map_err(|source| FlashError::write(offset, source))?;
        Ok(written as u64)
    }

    /// Flushes written data to the device.
    ///
    /// Character devices and similar special files reject the request with
    /// `EINVAL`; they have nothing to flush, so that is not an error.
    pub async fn sync(&mut self) -> Result<()> {
        let file = self.file().await?;
        let synced = task::spawn_blocking(move || file.sync_data())
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)));
        match synced {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                debug!(path = %self.path.display(), "target does not support sync");
                Ok(())
            }
            Err(source) => Err(FlashError::write(0, source)),
        }
    }

    /// Closes the descriptor.
    ///
    /// Safe to call any number of times; only the first call releases the
    /// file. A close issued while the open is still pending waits for it.
    pub async fn close(&mut self) -> Result<CloseOutcome> {
        let state = std::mem::replace(&mut self.state, State::Closed);
        let file = match state {
            State::Closed => return Ok(CloseOutcome::AlreadyClosed),
            State::Open(file) => Some(file),
            State::PendingOpen(handle) => handle
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e)))
                .ok()
                .map(Arc::new),
        };

        if let Some(file) = file {
            // Dropping the last reference closes the fd, which can block while
            // the kernel flushes a device.
            task::spawn_blocking(move || drop(file))
                .await
                .map_err(|e| FlashError::write(0, io::Error::other(e)))?;
        }
        debug!(path = %self.path.display(), "descriptor closed");
        Ok(CloseOutcome::Closed)
    }

    /// Hands the open file to a new owner without closing it.
    pub(crate) fn take(&mut self) -> Option<Descriptor> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Closed => None,
            state => Some(Descriptor {
                path: self.path.clone(),
                state,
            }),
        }
    }
}

#[cfg(unix)]
fn pread(file: &File, buffer: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buffer, offset)
}

#[cfg(windows)]
fn pread(file: &File, buffer: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buffer, offset)
}

#[cfg(unix)]
fn pwritev(file: &File, buffers: &[Bytes], offset: u64) -> io::Result<usize> {
    use std::io::IoSlice;

    let slices: Vec<IoSlice<'_>> = buffers.iter().map(|b| IoSlice::new(b)).collect();
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
    Ok(nix::sys::uio::pwritev(file, &slices, offset)?)
}

#[cfg(windows)]
fn pwritev(file: &File, buffers: &[Bytes], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;

    let joined = buffers.concat();
    file.seek_write(&joined, offset)
}
