use crate::device::Device;
use crate::error::{FlashError, Result};

/// Scans for all removable block devices on a Windows system.
///
/// Discovery is not available on Windows yet; this always returns
/// [`FlashError::Discovery`]. A target can still be given by path.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    // TODO: enumerate disks with SetupDiGetClassDevsW and query them through
    // DeviceIoControl (IOCTL_STORAGE_QUERY_PROPERTY for the removable flag).
    Err(FlashError::Discovery(
        "removable device discovery is not supported on Windows".to_string(),
    ))
}
