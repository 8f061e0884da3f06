//! Loop device lifecycle: create, mount, unmount, remove.
//!
//! Setup runs allocate -> bind -> (mount); teardown runs the exact reverse,
//! unmount -> resolve base device -> unbind. Any step that fails after a
//! binding was made unwinds that binding before the error is returned.

use crate::allocator::LoopAllocator;
use crate::binder::LoopBinder;
use crate::config::LoopkitConfig;
use crate::discovery::DeviceDiscovery;
use crate::state::{DeviceState, LoopDevice};
use loopkit_error::{LoopError, LoopResult};
use loopkit_hal::path::{is_loop_device_path, partition_path, resolve_base_device};
use loopkit_hal::{LoopFlags, LoopHal, LoopNode, MountOptions, MountRecord};
use std::path::{Path, PathBuf};

pub struct LifecycleOrchestrator<H: LoopHal> {
    hal: H,
    config: LoopkitConfig,
}

/// Where and how to mount a device.
#[derive(Debug, Clone)]
pub struct MountRequest<'p> {
    pub mount_point: &'p Path,
    /// Filesystem type; the configured default when `None`.
    pub fstype: Option<&'p str>,
    /// Mount this partition of the device instead of the whole device.
    pub partition: Option<u32>,
    /// Filesystem-specific mount data, as for `mount -o`.
    pub options: Option<&'p str>,
}

impl<'p> MountRequest<'p> {
    pub fn new(mount_point: &'p Path) -> Self {
        Self {
            mount_point,
            fstype: None,
            partition: None,
            options: None,
        }
    }

    pub fn fstype(mut self, fstype: &'p str) -> Self {
        self.fstype = Some(fstype);
        self
    }

    pub fn partition(mut self, partition: Option<u32>) -> Self {
        self.partition = partition;
        self
    }

    pub fn options(mut self, options: &'p str) -> Self {
        self.options = Some(options);
        self
    }
}

/// Mounts of `base` or any of its partitions, in table order.
fn mounts_of<'r>(records: &'r [MountRecord], base: &str) -> Vec<&'r MountRecord> {
    records
        .iter()
        .filter(|record| resolve_base_device(&record.source) == base)
        .collect()
}

/// First mount point of `base` or any of its partitions.
fn mounted_at(records: &[MountRecord], base: &str) -> Option<PathBuf> {
    mounts_of(records, base)
        .first()
        .map(|record| record.target.clone())
}

impl<H: LoopHal> LifecycleOrchestrator<H> {
    pub fn new(hal: H, config: LoopkitConfig) -> Self {
        Self { hal, config }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &LoopkitConfig {
        &self.config
    }

    pub fn discovery(&self) -> DeviceDiscovery<'_, H> {
        DeviceDiscovery::new(&self.hal)
    }

    pub fn allocator(&self) -> LoopAllocator<'_, H> {
        LoopAllocator::new(
            &self.hal,
            self.config.device_prefix.clone(),
            self.config.retry_policy(),
        )
    }

    pub fn binder(&self) -> LoopBinder<'_, H> {
        LoopBinder::new(&self.hal)
    }

    /// Allocate and bind a device for `backing`.
    pub fn create(&self, backing: &Path) -> LoopResult<LoopDevice> {
        self.with_new_binding(backing, |_| Ok(None))
    }

    /// Create a device for `backing` and mount it. A failed mount leaves the device free.
    pub fn create_and_mount(&self, backing: &Path, request: &MountRequest<'_>) -> LoopResult<LoopDevice> {
        self.with_new_binding(backing, |node| {
            let device = self.mount_source(node.path(), request.partition);
            self.mount_at(&device, request)?;
            Ok(Some(request.mount_point.to_path_buf()))
        })
    }

    /// Mount an existing device, or one of its partitions.
    pub fn mount_device(&self, device: &Path, request: &MountRequest<'_>) -> LoopResult<LoopDevice> {
        let device_str = device.to_string_lossy();
        if self.config.require_loop_device && !self.is_loop_device(&device_str) {
            return Err(LoopError::NotALoopDevice(device_str.to_string()));
        }
        let base = resolve_base_device(&device_str);
        let node = self.open_existing(&base)?;
        let status = self.binder().status(&node)?;
        let state = match status {
            Some(_) => DeviceState::Bound,
            None => DeviceState::Free,
        };
        state.transition(DeviceState::Mounted)?;

        let source = match request.partition {
            Some(n) => PathBuf::from(partition_path(&base, n)),
            None => device.to_path_buf(),
        };
        self.mount_at(&source, request)?;

        let observed = match status {
            Some(status) => LoopDevice::from_status(node.path(), status),
            None => LoopDevice::free(node.index(), node.path()),
        };
        Ok(observed.with_mount(Some(request.mount_point.to_path_buf())))
    }

    /// Mount `source`: an existing block device is mounted as-is, anything
    /// else is treated as a backing file and gets a fresh device.
    pub fn mount(&self, source: &Path, request: &MountRequest<'_>) -> LoopResult<LoopDevice> {
        if self.hal.is_block_device(source) {
            self.mount_device(source, request)
        } else {
            self.create_and_mount(source, request)
        }
    }

    /// Unmount `mount_point`, leaving its device bound.
    pub fn unmount(&self, mount_point: &Path) -> LoopResult<()> {
        let device = self
            .discovery()
            .find_device_for_mount_point(mount_point)?
            .ok_or_else(|| LoopError::NoSuchMountPoint(mount_point.to_path_buf()))?;
        self.unmount_target(mount_point)?;
        log::info!("unmounted {} from {}", device, mount_point.display());
        Ok(())
    }

    /// Tear down whatever `path` names: a loop device (or partition of one) or
    /// a mount point backed by one. Succeeds only once the base device is free.
    ///
    /// Every mount of the base device and of its partitions comes off before
    /// the unbind, wherever the caller pointed.
    pub fn remove(&self, path: &Path) -> LoopResult<()> {
        let discovery = self.discovery();
        let device = if self.hal.is_block_device(path) {
            path.to_string_lossy().to_string()
        } else {
            discovery
                .find_device_for_mount_point(path)?
                .ok_or_else(|| LoopError::NoSuchMountPoint(path.to_path_buf()))?
        };
        log::debug!("remove {} resolved to device {}", path.display(), device);

        if self.config.require_loop_device && !self.is_loop_device(&device) {
            return Err(LoopError::NotALoopDevice(device));
        }

        let base = resolve_base_device(&device);
        let records = discovery.records()?;
        // Stacked mounts come off top first.
        for record in mounts_of(&records, &base).into_iter().rev() {
            self.unmount_target(&record.target)?;
            log::info!("unmounted {} from {}", record.source, record.target.display());
        }

        let node = self
            .hal
            .open_node(Path::new(&base))
            .map_err(|source| LoopError::UnbindFailed {
                device: base.clone(),
                source,
            })?;
        self.binder().unbind(&node)
    }

    /// Observed state of `device`.
    pub fn status(&self, device: &Path) -> LoopResult<LoopDevice> {
        let device_str = device.to_string_lossy();
        let base = resolve_base_device(&device_str);
        if !self.is_loop_device(&base) {
            return Err(LoopError::NotALoopDevice(device_str.to_string()));
        }
        let node = self.open_existing(&base)?;
        let observed = match self.binder().status(&node)? {
            Some(status) => LoopDevice::from_status(node.path(), status),
            None => return Ok(LoopDevice::free(node.index(), node.path())),
        };
        let records = self.discovery().records()?;
        Ok(observed.with_mount(mounted_at(&records, &base)))
    }

    /// Bound loop devices as reported by sysfs, with their first mount point.
    pub fn list(&self) -> LoopResult<Vec<LoopDevice>> {
        let bound = self.hal.scan_loop_devices()?;
        let records = self.discovery().records()?;
        Ok(bound
            .into_iter()
            .map(|info| {
                let mount = mounted_at(&records, &info.dev_path.to_string_lossy());
                LoopDevice {
                    index: info.index,
                    path: info.dev_path,
                    backing_file: Some(info.backing_file),
                    flags: LoopFlags::new()
                        .read_only(info.read_only)
                        .autoclear(info.autoclear)
                        .part_scan(info.part_scan),
                    mounted_at: mount,
                }
            })
            .collect())
    }

    fn is_loop_device(&self, device: &str) -> bool {
        is_loop_device_path(device, &self.config.device_prefix)
    }

    fn open_existing(&self, base: &str) -> LoopResult<H::Node> {
        self.hal
            .open_node(Path::new(base))
            .map_err(|source| LoopError::StatusFailed {
                device: base.to_string(),
                source,
            })
    }

    fn mount_source(&self, device: &Path, partition: Option<u32>) -> PathBuf {
        match partition {
            Some(n) => PathBuf::from(partition_path(&device.to_string_lossy(), n)),
            None => device.to_path_buf(),
        }
    }

    fn mount_at(&self, device: &Path, request: &MountRequest<'_>) -> LoopResult<()> {
        let target = request.mount_point;
        self.hal
            .create_dir(target, self.config.mount_dir_mode)
            .map_err(|source| LoopError::CreateMountPointFailed {
                path: target.to_path_buf(),
                source,
            })?;

        let fstype = request.fstype.unwrap_or(&self.config.default_fstype);
        let mut options = MountOptions::new().read_only(self.config.read_only);
        if let Some(data) = request.options {
            options = options.with_data(data);
        }
        self.hal
            .mount_device(device, target, fstype, &options)
            .map_err(|source| LoopError::MountFailed {
                device: device.display().to_string(),
                target: target.to_path_buf(),
                source,
            })?;
        log::info!(
            "mounted {} on {} ({})",
            device.display(),
            target.display(),
            fstype
        );
        Ok(())
    }

    fn unmount_target(&self, target: &Path) -> LoopResult<()> {
        self.hal
            .unmount(target)
            .map_err(|source| LoopError::UnmountFailed {
                target: target.to_path_buf(),
                source,
            })
    }

    /// Allocate, bind, then run `then` while the binding is still guarded.
    /// The binding is kept only if `then` succeeds.
    fn with_new_binding<F>(&self, backing: &Path, then: F) -> LoopResult<LoopDevice>
    where
        F: FnOnce(&H::Node) -> LoopResult<Option<PathBuf>>,
    {
        let flags = self.config.loop_flags();
        let binder = self.binder();
        binder.validate_backing(backing, flags.read_only)?;

        let (index, node) = self.allocator().allocate()?;
        let guard = binder.bind(&node, backing, flags)?;
        let mount_point = then(guard.node())?;
        guard.release();

        let device = LoopDevice {
            index,
            path: node.path().to_path_buf(),
            backing_file: Some(backing.to_path_buf()),
            flags,
            mounted_at: mount_point,
        };
        log::info!(
            "{} is {} ({})",
            device.path.display(),
            device.state(),
            backing.display()
        );
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopkit_hal::{FakeHal, LoopOps, Operation};
    use nix::errno::Errno;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn orchestrator(hal: &FakeHal) -> LifecycleOrchestrator<FakeHal> {
        let mut config = LoopkitConfig::default();
        config.retry.interval_ms = 0;
        LifecycleOrchestrator::new(hal.clone(), config)
    }

    fn image(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("img.bin");
        fs::write(&path, vec![0u8; 8192]).unwrap();
        path
    }

    #[test]
    fn create_binds_with_configured_flags() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new();

        let device = orchestrator(&hal).create(&backing).unwrap();
        assert_eq!(device.path, PathBuf::from("/dev/loop0"));
        assert_eq!(device.state(), DeviceState::Bound);
        assert!(device.flags.part_scan);
        assert_eq!(hal.binding(0), Some(backing));
    }

    #[test]
    fn create_fails_without_allocating_for_missing_backing() {
        let dir = tempdir().unwrap();
        let hal = FakeHal::new();

        let err = orchestrator(&hal)
            .create(&dir.path().join("missing.bin"))
            .unwrap_err();
        assert!(matches!(err, LoopError::BackingFileInaccessible { .. }));
        assert_eq!(hal.operation_count(), 0);
    }

    #[test]
    fn bind_failure_after_allocation_leaves_device_free() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new();
        hal.fail_next_attach(Errno::EIO);

        let err = orchestrator(&hal).create(&backing).unwrap_err();
        assert!(matches!(err, LoopError::BindFailed { .. }));
        assert_eq!(hal.bound_count(), 0);
    }

    #[test]
    fn failed_mount_unwinds_the_new_binding() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new();
        hal.fail_next_mount(Errno::EINVAL);

        let err = orchestrator(&hal)
            .create_and_mount(&backing, &MountRequest::new(Path::new("/mnt/x")))
            .unwrap_err();
        assert!(matches!(err, LoopError::MountFailed { .. }));
        assert_eq!(hal.bound_count(), 0);
    }

    #[test]
    fn create_and_mount_uses_default_fstype_and_mode() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new();

        let device = orchestrator(&hal)
            .create_and_mount(&backing, &MountRequest::new(Path::new("/mnt/x")))
            .unwrap();
        assert_eq!(device.state(), DeviceState::Mounted);
        assert!(hal.has_operation(|op| op
            == &Operation::CreateDir {
                path: PathBuf::from("/mnt/x"),
                mode: 0o755,
            }));
        assert!(hal.has_operation(|op| op
            == &Operation::Mount {
                device: PathBuf::from("/dev/loop0"),
                target: PathBuf::from("/mnt/x"),
                fstype: "ext2".to_string(),
            }));
    }

    #[test]
    fn mount_data_is_passed_through() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new();

        orchestrator(&hal)
            .create_and_mount(
                &backing,
                &MountRequest::new(Path::new("/mnt/x")).options("noatime,errors=remount-ro"),
            )
            .unwrap();
        assert_eq!(hal.mounts()[0].options, "rw,noatime,errors=remount-ro");
    }

    #[test]
    fn partition_can_be_mounted() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new().with_partitions(2);
        let lifecycle = orchestrator(&hal);

        lifecycle
            .create_and_mount(
                &backing,
                &MountRequest::new(Path::new("/mnt/p2"))
                    .fstype("vfat")
                    .partition(Some(2)),
            )
            .unwrap();
        assert_eq!(hal.mounts()[0].source, "/dev/loop0p2");

        lifecycle.remove(Path::new("/mnt/p2")).unwrap();
        assert_eq!(hal.bound_count(), 0);
    }

    #[test]
    fn mounting_a_free_device_is_an_invalid_transition() {
        let hal = FakeHal::new();
        hal.free_index().unwrap();

        let err = orchestrator(&hal)
            .mount_device(Path::new("/dev/loop0"), &MountRequest::new(Path::new("/mnt/x")))
            .unwrap_err();
        assert!(matches!(err, LoopError::InvalidTransition { .. }));
        assert!(!hal.has_operation(|op| matches!(op, Operation::Mount { .. })));
    }

    #[test]
    fn mount_dispatches_on_block_devices() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new();
        let lifecycle = orchestrator(&hal);

        let created = lifecycle.create(&backing).unwrap();
        let mounted = lifecycle
            .mount(&created.path, &MountRequest::new(Path::new("/mnt/a")))
            .unwrap();
        assert_eq!(mounted.index, created.index);
        assert_eq!(hal.bound_count(), 1);

        let fresh = lifecycle
            .mount(&backing, &MountRequest::new(Path::new("/mnt/b")))
            .unwrap();
        assert_eq!(fresh.index, 1);
        assert_eq!(hal.bound_count(), 2);
    }

    #[test]
    fn unmount_keeps_the_binding() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new();
        let lifecycle = orchestrator(&hal);
        lifecycle
            .create_and_mount(&backing, &MountRequest::new(Path::new("/mnt/x")))
            .unwrap();

        lifecycle.unmount(Path::new("/mnt/x")).unwrap();
        assert!(hal.mounts().is_empty());
        assert_eq!(
            lifecycle.status(Path::new("/dev/loop0")).unwrap().state(),
            DeviceState::Bound
        );
        assert!(matches!(
            lifecycle.unmount(Path::new("/mnt/x")).unwrap_err(),
            LoopError::NoSuchMountPoint(_)
        ));
    }

    #[test]
    fn remove_by_device_unmounts_stacked_mounts_in_reverse() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new();
        let lifecycle = orchestrator(&hal);
        lifecycle
            .create_and_mount(&backing, &MountRequest::new(Path::new("/mnt/a")))
            .unwrap();
        lifecycle
            .mount_device(Path::new("/dev/loop0"), &MountRequest::new(Path::new("/mnt/b")))
            .unwrap();
        hal.clear();

        lifecycle.remove(Path::new("/dev/loop0")).unwrap();
        let unmounts: Vec<_> = hal
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Unmount { target } => Some(target),
                _ => None,
            })
            .collect();
        assert_eq!(unmounts, vec![PathBuf::from("/mnt/b"), PathBuf::from("/mnt/a")]);
        assert_eq!(hal.bound_count(), 0);
    }

    #[test]
    fn remove_rejects_non_loop_sources() {
        let hal = FakeHal::new();
        hal.add_block_device("/dev/sda1");
        hal.add_mount("/dev/sda1", "/boot", "vfat");

        let err = orchestrator(&hal).remove(Path::new("/boot")).unwrap_err();
        assert!(matches!(err, LoopError::NotALoopDevice(_)));
        assert!(!hal.has_operation(|op| matches!(op, Operation::Unmount { .. })));
    }

    #[test]
    fn remove_of_free_device_is_success() {
        let hal = FakeHal::new();
        hal.free_index().unwrap();

        orchestrator(&hal).remove(Path::new("/dev/loop0")).unwrap();
        assert!(!hal.has_operation(|op| matches!(op, Operation::Detach { .. })));
    }

    #[test]
    fn status_reports_mount_of_any_partition() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new().with_partitions(1);
        let lifecycle = orchestrator(&hal);
        lifecycle
            .create_and_mount(
                &backing,
                &MountRequest::new(Path::new("/mnt/x")).partition(Some(1)),
            )
            .unwrap();

        let device = lifecycle.status(Path::new("/dev/loop0p1")).unwrap();
        assert_eq!(device.path, PathBuf::from("/dev/loop0"));
        assert_eq!(device.mounted_at, Some(PathBuf::from("/mnt/x")));
        assert_eq!(device.backing_file, Some(backing));

        assert!(matches!(
            lifecycle.status(Path::new("/dev/sda")).unwrap_err(),
            LoopError::NotALoopDevice(_)
        ));
    }

    #[test]
    fn list_annotates_mounts() {
        let dir = tempdir().unwrap();
        let backing = image(&dir);
        let hal = FakeHal::new();
        let lifecycle = orchestrator(&hal);
        lifecycle.create(&backing).unwrap();
        lifecycle
            .create_and_mount(&backing, &MountRequest::new(Path::new("/mnt/y")))
            .unwrap();

        let devices = lifecycle.list().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].state(), DeviceState::Bound);
        assert_eq!(devices[1].mounted_at, Some(PathBuf::from("/mnt/y")));
    }

    #[test]
    fn retry_policy_comes_from_config() {
        let hal = FakeHal::new();
        let lifecycle = orchestrator(&hal);
        assert_eq!(lifecycle.allocator().device_path(3), PathBuf::from("/dev/loop3"));
        assert_eq!(lifecycle.config().retry_policy().interval, Duration::from_millis(0));
    }
}
