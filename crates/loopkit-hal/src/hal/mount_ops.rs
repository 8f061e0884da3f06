//! Mount operations and mount-table access.

use crate::HalResult;
use std::path::Path;

/// Trait for mounting and unmounting filesystems.
pub trait MountOps {
    /// Mount a device to a target path.
    ///
    /// # Arguments
    /// * `device` - Device path (e.g., `/dev/loop0p1`)
    /// * `target` - Mount point path
    /// * `fstype` - Filesystem type (e.g., `"ext2"`)
    /// * `options` - Mount options
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &MountOptions,
    ) -> HalResult<()>;

    /// Unmount the filesystem mounted at `target`.
    fn unmount(&self, target: &Path) -> HalResult<()>;
}

/// Read access to the live mount table.
pub trait MountTableOps {
    /// Path of the table, for error reporting.
    fn mount_table_path(&self) -> &Path;

    /// Raw table contents in `/proc/self/mounts` format, read fresh on every call.
    fn read_mount_table(&self) -> HalResult<String>;
}

/// Mount options and flags.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Mount read-only (`MS_RDONLY`).
    pub read_only: bool,
    /// Additional filesystem-specific data as a comma-separated string (e.g., "errors=remount-ro")
    pub data: Option<String>,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}
