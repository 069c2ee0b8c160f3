use crate::descriptor::OpenFlags;
use std::fs::OpenOptions;

/// Applies the Unix-only parts of [`OpenFlags`] (raw `open(2)` flags and the
/// creation mode) to `options`.
#[cfg(unix)]
pub(crate) fn apply_platform_flags(options: &mut OpenOptions, flags: &OpenFlags, mode: u32) {
    use std::os::unix::fs::OpenOptionsExt;

    options.mode(mode).custom_flags(flags.custom);
}

#[cfg(windows)]
pub(crate) fn apply_platform_flags(_options: &mut OpenOptions, _flags: &OpenFlags, _mode: u32) {
    // FILE_FLAG_NO_BUFFERING and friends can only be passed through
    // `CreateFileW`, which `std::fs::OpenOptions` does not expose. Raw flags
    // and the creation mode are Unix notions and are ignored here.
}

/// Builds the `OpenOptions` for a descriptor.
pub(crate) fn open_options(flags: &OpenFlags, mode: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    options
        .read(flags.read)
        .write(flags.write)
        .create(flags.create)
        .truncate(flags.truncate);
    apply_platform_flags(&mut options, flags, mode);
    options
}
