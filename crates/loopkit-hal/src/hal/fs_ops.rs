//! Filesystem queries the lifecycle needs (block-device checks, access checks, sysfs scans).

use crate::sysfs::LoopSysfsInfo;
use crate::HalResult;
use std::path::Path;

pub trait FsOps {
    /// True iff `path` exists and is a block device. Never fails.
    fn is_block_device(&self, path: &Path) -> bool;

    /// Check `path` exists and is readable (and writable when `write` is set).
    ///
    /// Fails with an `ENOENT`-classified error when the path is missing and an
    /// `EACCES`-classified one when the access mode is denied.
    fn check_access(&self, path: &Path, write: bool) -> HalResult<()>;

    /// Create a directory (and parents) with the given mode. An existing directory is not an error.
    fn create_dir(&self, path: &Path, mode: u32) -> HalResult<()>;

    /// Bound loop devices as reported by sysfs.
    fn scan_loop_devices(&self) -> HalResult<Vec<LoopSysfsInfo>>;
}
