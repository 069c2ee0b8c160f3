use crate::error::{FlashError, Result};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Represents a block device discovered on the system.
///
/// Populated by the platform-specific discovery functions in the
/// [`crate::platform`] module.
#[derive(Clone, Debug)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// The total size of the device in bytes.
    pub size: u64,
    /// The primary mount point of the device, if any.
    pub mount_point: String,
}

impl Device {
    pub fn size_gb(&self) -> f64 {
        self.size as f64 / GIB
    }

    /// Whether an image of `bytes` bytes fits on this device.
    pub fn fits(&self, bytes: u64) -> bool {
        bytes <= self.size
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if !self.mount_point.is_empty() {
            format!("[Mounted at {}]", self.mount_point)
        } else {
            "[Not mounted]".to_string()
        };

        write!(
            f,
            "{:<15} {:.1} GB {}",
            self.path.display(),
            self.size_gb(),
            mount_info
        )
    }
}

#[cfg(target_os = "linux")]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Returns the capacity of a flash target if it has a fixed one.
///
/// Block devices report their size. Regular files can grow, and a path that
/// does not exist yet will be created, so both yield `None`.
pub fn target_capacity(path: &Path) -> Result<Option<u64>> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FlashError::open(path, e)),
    };

    if metadata.is_file() {
        return Ok(None);
    }

    let file = File::open(path).map_err(|e| FlashError::open(path, e))?;
    block_device_size(&file)
        .map(Some)
        .map_err(|e| FlashError::open(path, e))
}

#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> std::io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes)?;
    }
    Ok(size_bytes)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File) -> std::io::Result<u64> {
    use std::io::{Seek, SeekFrom};

    let mut file = file;
    file.seek(SeekFrom::End(0))
}
