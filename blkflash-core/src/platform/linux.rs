//! Removable block device discovery through sysfs.
use crate::device::Device;
use crate::error::{FlashError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

const SYS_BLOCK: &str = "/sys/block";
/// sysfs reports sizes in 512-byte sectors whatever the logical block size.
const SYSFS_SECTOR_SIZE: u64 = 512;

fn sysfs_attribute(device: &str, attribute: &str) -> Option<String> {
    let path = Path::new(SYS_BLOCK).join(device).join(attribute);
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Strips the partition suffix: `/dev/sda1` to `/dev/sda`, `/dev/nvme0n1p2`
/// to `/dev/nvme0n1`.
fn whole_disk(partition: &Path) -> PathBuf {
    let text = partition.to_string_lossy();
    let cut = if text.starts_with("/dev/sd") {
        text.rfind(|c: char| c.is_alphabetic()).map(|i| i + 1)
    } else if text.starts_with("/dev/mmcblk") || text.starts_with("/dev/nvme") {
        text.rfind('p').filter(|&i| i > "/dev/".len())
    } else {
        None
    };
    match cut {
        Some(end) => PathBuf::from(&text[..end]),
        None => partition.to_path_buf(),
    }
}

/// The disk holding the root filesystem, never offered as a target.
fn system_disk(disks: &Disks) -> Result<PathBuf> {
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| whole_disk(&Path::new("/dev").join(disk.name())))
        .ok_or_else(|| FlashError::Discovery("could not determine the system disk".to_string()))
}

/// Size in bytes of a removable device, or `None` if it is fixed or empty
/// (a card reader without a card reports zero sectors).
fn removable_size(device: &str) -> Option<u64> {
    if sysfs_attribute(device, "removable").as_deref() != Some("1") {
        return None;
    }
    let sectors: u64 = sysfs_attribute(device, "size")?.parse().ok()?;
    (sectors > 0).then(|| sectors * SYSFS_SECTOR_SIZE)
}

/// First mount point of any partition of `device`, or an empty string.
fn mount_point(disks: &Disks, device: &str) -> String {
    disks
        .iter()
        .filter(|disk| disk.name().to_string_lossy().starts_with(device))
        .map(|disk| disk.mount_point().to_string_lossy().to_string())
        .find(|mount| !mount.is_empty())
        .unwrap_or_default()
}

/// Lists removable block devices, leaving out loop devices and the disk the
/// system runs from.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let disks = Disks::new_with_refreshed_list();
    let system = system_disk(&disks)?;

    let entries = fs::read_dir(SYS_BLOCK)
        .map_err(|e| FlashError::Discovery(format!("cannot read {SYS_BLOCK}: {e}")))?;

    let mut devices = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = Path::new("/dev").join(&name);
        if name.starts_with("loop") || path == system {
            debug!(device = %name, "skipping loop or system device");
            continue;
        }

        let Some(size) = removable_size(&name) else {
            continue;
        };
        devices.push(Device {
            mount_point: mount_point(&disks, &name),
            path,
            name,
            size,
        });
    }
    debug!(count = devices.len(), "removable devices found");
    Ok(devices)
}
