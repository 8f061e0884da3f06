//! Mount-table queries: mount point to device, device to mount points.
//!
//! The table is read fresh on every call. Nothing here is cached, since every
//! answer feeds a decision about whether it is safe to unbind.

use loopkit_error::{LoopError, LoopResult};
use loopkit_hal::procfs::mounts::{parse_mounts, source_for_target, targets_for_source};
use loopkit_hal::{FsOps, MountRecord, MountTableOps};
use std::path::{Path, PathBuf};

pub struct DeviceDiscovery<'a, H: MountTableOps + FsOps + ?Sized> {
    hal: &'a H,
}

impl<'a, H: MountTableOps + FsOps + ?Sized> DeviceDiscovery<'a, H> {
    pub fn new(hal: &'a H) -> Self {
        Self { hal }
    }

    /// Fresh snapshot of the parsed mount table.
    pub fn records(&self) -> LoopResult<Vec<MountRecord>> {
        let content = self
            .hal
            .read_mount_table()
            .map_err(|source| LoopError::TableUnavailable {
                path: self.hal.mount_table_path().to_path_buf(),
                source,
            })?;
        Ok(parse_mounts(&content))
    }

    /// Source of the first table entry mounted exactly at `mount_point`.
    pub fn find_device_for_mount_point(&self, mount_point: &Path) -> LoopResult<Option<String>> {
        let records = self.records()?;
        let found = source_for_target(&records, mount_point).map(str::to_string);
        log::debug!(
            "mount point {} resolves to {:?}",
            mount_point.display(),
            found
        );
        Ok(found)
    }

    /// True iff `device` is a block device with at least one mount-table entry.
    ///
    /// Paths that are not block devices are never mounted as far as this
    /// check is concerned, and do not cause the table to be read.
    pub fn is_device_mounted(&self, device: &Path) -> LoopResult<bool> {
        if !self.hal.is_block_device(device) {
            log::debug!("{} is not a block device", device.display());
            return Ok(false);
        }
        let records = self.records()?;
        let source = device.to_string_lossy();
        Ok(records.iter().any(|record| record.source == source))
    }

    /// Every mount directory of `device`, in table order.
    pub fn mount_points_for_device(&self, device: &str) -> LoopResult<Vec<PathBuf>> {
        let records = self.records()?;
        Ok(targets_for_source(&records, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopkit_hal::FakeHal;

    #[test]
    fn first_matching_entry_wins() {
        let hal = FakeHal::new();
        hal.add_mount("/dev/loop1", "/mnt/x", "ext2");
        hal.add_mount("/dev/loop2", "/mnt/x", "ext2");

        let discovery = DeviceDiscovery::new(&hal);
        assert_eq!(
            discovery
                .find_device_for_mount_point(Path::new("/mnt/x"))
                .unwrap()
                .as_deref(),
            Some("/dev/loop1")
        );
        assert_eq!(
            discovery
                .find_device_for_mount_point(Path::new("/mnt/x/"))
                .unwrap()
                .as_deref(),
            Some("/dev/loop1")
        );
        assert!(discovery
            .find_device_for_mount_point(Path::new("/mnt"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn non_block_devices_are_never_mounted() {
        let hal = FakeHal::new();
        hal.add_mount("tmpfs", "/tmp", "tmpfs");
        hal.set_table_unavailable(true);

        let discovery = DeviceDiscovery::new(&hal);
        assert!(!discovery.is_device_mounted(Path::new("tmpfs")).unwrap());
        assert!(!discovery
            .is_device_mounted(Path::new("/dev/loop0"))
            .unwrap());
    }

    #[test]
    fn block_device_needs_an_exact_source_match() {
        let hal = FakeHal::new();
        hal.add_block_device("/dev/sdb");
        hal.add_block_device("/dev/sdb1");
        hal.add_mount("/dev/sdb1", "/data", "ext4");

        let discovery = DeviceDiscovery::new(&hal);
        assert!(discovery.is_device_mounted(Path::new("/dev/sdb1")).unwrap());
        assert!(!discovery.is_device_mounted(Path::new("/dev/sdb")).unwrap());
    }

    #[test]
    fn mount_points_are_listed_in_table_order() {
        let hal = FakeHal::new();
        hal.add_mount("/dev/loop0", "/mnt/a", "ext2");
        hal.add_mount("/dev/loop1", "/mnt/b", "ext2");
        hal.add_mount("/dev/loop0", "/mnt/c", "ext2");

        let discovery = DeviceDiscovery::new(&hal);
        assert_eq!(
            discovery.mount_points_for_device("/dev/loop0").unwrap(),
            vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/c")]
        );
    }

    #[test]
    fn unreadable_table_is_reported() {
        let hal = FakeHal::new();
        hal.set_table_unavailable(true);

        let err = DeviceDiscovery::new(&hal)
            .find_device_for_mount_point(Path::new("/mnt/x"))
            .unwrap_err();
        assert!(matches!(err, LoopError::TableUnavailable { .. }));
        assert_eq!(err.step(), "discover");
    }
}
