//! Fake HAL implementation for testing.
//!
//! This implementation simulates a small loop-device kernel (loop-control
//! allocation, bindings, partition nodes and a mount table) and records every
//! operation, allowing CI-safe testing without root privileges or real hardware.

use super::{FsOps, LoopFlags, LoopNode, LoopOps, LoopStatus, MountOps, MountOptions, MountTableOps};
use crate::path::{parse_loop_index, partition_path, resolve_base_device};
use crate::procfs::mounts::{normalize_path, render_mounts, MountRecord};
use crate::sysfs::LoopSysfsInfo;
use crate::{HalError, HalResult};
use nix::errno::Errno;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    FreeIndex {
        index: u32,
    },
    OpenNode {
        device: PathBuf,
    },
    Attach {
        device: PathBuf,
        backing: PathBuf,
        flags: LoopFlags,
    },
    Detach {
        device: PathBuf,
    },
    Mount {
        device: PathBuf,
        target: PathBuf,
        fstype: String,
    },
    Unmount {
        target: PathBuf,
    },
    CreateDir {
        path: PathBuf,
        mode: u32,
    },
}

#[derive(Debug, Clone)]
struct FakeBinding {
    backing: PathBuf,
    flags: LoopFlags,
}

/// Shared state for FakeHal operations.
#[derive(Debug, Default)]
struct FakeHalState {
    /// All operations that were recorded
    operations: Vec<Operation>,
    /// Bound devices by index
    bindings: BTreeMap<u32, FakeBinding>,
    /// Paths that currently stat as block devices
    block_devices: HashSet<PathBuf>,
    /// Directories created through `create_dir`
    dirs: HashSet<PathBuf>,
    /// Live mount table, in mount order
    mounts: Vec<MountRecord>,
    denied: HashSet<PathBuf>,
    write_denied: HashSet<PathBuf>,
    partitions: u32,
    max_devices: Option<u32>,
    open_failures: VecDeque<Errno>,
    attach_failure: Option<Errno>,
    mount_failure: Option<Errno>,
    unmount_failure: Option<Errno>,
    table_unavailable: bool,
}

impl FakeHalState {
    /// A loop device node (or one of its partitions) whose base is bound.
    fn is_bound_node(&self, device: &Path) -> bool {
        let base = resolve_base_device(&device.to_string_lossy());
        match parse_loop_index(&base, "/dev/loop") {
            Some(index) => self.bindings.contains_key(&index) && self.block_devices.contains(device),
            None => false,
        }
    }
}

/// Fake HAL implementation that simulates the loop driver in memory.
///
/// Clones share the same simulated kernel. Device nodes are always named
/// `/dev/loopN`.
#[derive(Debug, Clone)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
    mount_table: PathBuf,
}

impl Default for FakeHal {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulated open device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLoopNode {
    index: u32,
    path: PathBuf,
}

impl LoopNode for FakeLoopNode {
    fn index(&self) -> u32 {
        self.index
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/loop{}", index))
}

impl FakeHal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeHalState::default())),
            mount_table: PathBuf::from("/proc/self/mounts"),
        }
    }

    /// Expose `n` partition nodes (`/dev/loopNp1..pn`) on devices bound with part scan.
    pub fn with_partitions(self, n: u32) -> Self {
        self.state.lock().unwrap().partitions = n;
        self
    }

    /// Limit the number of loop devices loop-control will hand out.
    pub fn with_max_devices(self, n: u32) -> Self {
        self.state.lock().unwrap().max_devices = Some(n);
        self
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.state.lock().unwrap().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state.lock().unwrap().operations.iter().any(check)
    }

    /// Clear recorded operations. The simulated kernel state is kept.
    pub fn clear(&self) {
        self.state.lock().unwrap().operations.clear();
    }

    /// Make `path` stat as a block device that is not a loop device.
    pub fn add_block_device(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().block_devices.insert(path.into());
    }

    /// Add a mount-table entry directly, bypassing `mount_device`.
    pub fn add_mount(&self, source: &str, target: impl Into<PathBuf>, fstype: &str) {
        self.state.lock().unwrap().mounts.push(MountRecord {
            source: source.to_string(),
            target: target.into(),
            fstype: fstype.to_string(),
            options: "rw".to_string(),
        });
    }

    /// Deny all access to `path` (`EACCES`).
    pub fn deny_access(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().denied.insert(path.into());
    }

    /// Deny write access to `path` only.
    pub fn deny_write(&self, path: impl Into<PathBuf>) {
        self.state.lock().unwrap().write_denied.insert(path.into());
    }

    /// Queue errors for the next `open_node` calls, one per call.
    pub fn fail_open_node(&self, errnos: impl IntoIterator<Item = Errno>) {
        self.state.lock().unwrap().open_failures.extend(errnos);
    }

    /// Fail the next `attach` after the fd has been set, leaving the device bound.
    pub fn fail_next_attach(&self, errno: Errno) {
        self.state.lock().unwrap().attach_failure = Some(errno);
    }

    pub fn fail_next_mount(&self, errno: Errno) {
        self.state.lock().unwrap().mount_failure = Some(errno);
    }

    pub fn fail_next_unmount(&self, errno: Errno) {
        self.state.lock().unwrap().unmount_failure = Some(errno);
    }

    pub fn set_table_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().table_unavailable = unavailable;
    }

    /// Current backing file of `/dev/loop<index>`, if bound.
    pub fn binding(&self, index: u32) -> Option<PathBuf> {
        self.state
            .lock()
            .unwrap()
            .bindings
            .get(&index)
            .map(|b| b.backing.clone())
    }

    /// Number of bound devices.
    pub fn bound_count(&self) -> usize {
        self.state.lock().unwrap().bindings.len()
    }

    /// Snapshot of the simulated mount table.
    pub fn mounts(&self) -> Vec<MountRecord> {
        self.state.lock().unwrap().mounts.clone()
    }

    fn record_operation(&self, op: Operation) {
        self.state.lock().unwrap().operations.push(op);
    }
}

impl LoopOps for FakeHal {
    type Node = FakeLoopNode;

    fn free_index(&self) -> HalResult<u32> {
        let mut state = self.state.lock().unwrap();
        let limit = state.max_devices.unwrap_or(u32::MAX);
        let index = (0..limit)
            .find(|i| !state.bindings.contains_key(i))
            .ok_or(HalError::Nix(Errno::ENOSPC))?;
        state.block_devices.insert(device_path(index));
        state.operations.push(Operation::FreeIndex { index });
        Ok(index)
    }

    fn open_node(&self, path: &Path) -> HalResult<FakeLoopNode> {
        self.record_operation(Operation::OpenNode {
            device: path.to_path_buf(),
        });
        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.open_failures.pop_front() {
            return Err(HalError::Nix(errno));
        }
        let index = parse_loop_index(&path.to_string_lossy(), "/dev/loop")
            .ok_or_else(|| HalError::Parse(format!("not a loop device node: {}", path.display())))?;
        if !state.block_devices.contains(path) {
            return Err(HalError::Nix(Errno::ENOENT));
        }
        Ok(FakeLoopNode {
            index,
            path: path.to_path_buf(),
        })
    }

    fn attach(
        &self,
        node: &FakeLoopNode,
        _backing: &File,
        backing_path: &Path,
        flags: LoopFlags,
    ) -> HalResult<()> {
        self.record_operation(Operation::Attach {
            device: node.path.clone(),
            backing: backing_path.to_path_buf(),
            flags,
        });
        let mut state = self.state.lock().unwrap();
        if state.bindings.contains_key(&node.index) {
            return Err(HalError::DiskBusy);
        }
        state.bindings.insert(
            node.index,
            FakeBinding {
                backing: backing_path.to_path_buf(),
                flags: LoopFlags::new(),
            },
        );
        if let Some(errno) = state.attach_failure.take() {
            return Err(HalError::Nix(errno));
        }
        if let Some(binding) = state.bindings.get_mut(&node.index) {
            binding.flags = flags;
        }
        if flags.part_scan {
            for n in 1..=state.partitions {
                let part = partition_path(&node.path.to_string_lossy(), n);
                state.block_devices.insert(PathBuf::from(part));
            }
        }
        Ok(())
    }

    fn detach(&self, node: &FakeLoopNode) -> HalResult<()> {
        self.record_operation(Operation::Detach {
            device: node.path.clone(),
        });
        let mut state = self.state.lock().unwrap();
        if !state.bindings.contains_key(&node.index) {
            return Err(HalError::Nix(Errno::ENXIO));
        }
        let base = node.path.to_string_lossy().to_string();
        let busy = state
            .mounts
            .iter()
            .any(|m| resolve_base_device(&m.source) == base);
        if busy {
            return Err(HalError::DiskBusy);
        }
        state.bindings.remove(&node.index);
        let prefix = format!("{}p", base);
        state
            .block_devices
            .retain(|p| !p.to_string_lossy().starts_with(&prefix));
        Ok(())
    }

    fn status(&self, node: &FakeLoopNode) -> HalResult<Option<LoopStatus>> {
        let state = self.state.lock().unwrap();
        Ok(state.bindings.get(&node.index).map(|b| LoopStatus {
            index: node.index,
            backing_file: b.backing.clone(),
            offset: 0,
            size_limit: 0,
            flags: b.flags,
        }))
    }
}

impl MountOps for FakeHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &MountOptions,
    ) -> HalResult<()> {
        self.record_operation(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
        });
        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.mount_failure.take() {
            return Err(HalError::Nix(errno));
        }
        if !state.block_devices.contains(device) {
            return Err(HalError::Nix(Errno::ENOTBLK));
        }
        if crate::path::is_loop_device_path(&device.to_string_lossy(), "/dev/loop")
            && !state.is_bound_node(device)
        {
            return Err(HalError::Nix(Errno::ENXIO));
        }
        if !state.dirs.contains(target) && !target.is_dir() {
            return Err(HalError::Nix(Errno::ENOENT));
        }
        let mode = if options.read_only { "ro" } else { "rw" };
        state.mounts.push(MountRecord {
            source: device.to_string_lossy().to_string(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
            options: match &options.data {
                Some(data) => format!("{},{}", mode, data),
                None => mode.to_string(),
            },
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        self.record_operation(Operation::Unmount {
            target: target.to_path_buf(),
        });
        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.unmount_failure.take() {
            return Err(match errno {
                Errno::EBUSY => HalError::DiskBusy,
                other => HalError::Nix(other),
            });
        }
        let wanted = normalize_path(target);
        // The most recent mount on a target is the one visible there.
        let pos = state
            .mounts
            .iter()
            .rposition(|m| normalize_path(&m.target) == wanted)
            .ok_or(HalError::Nix(Errno::EINVAL))?;
        state.mounts.remove(pos);
        Ok(())
    }
}

impl MountTableOps for FakeHal {
    fn mount_table_path(&self) -> &Path {
        &self.mount_table
    }

    fn read_mount_table(&self) -> HalResult<String> {
        let state = self.state.lock().unwrap();
        if state.table_unavailable {
            return Err(HalError::Nix(Errno::ENOENT));
        }
        Ok(render_mounts(&state.mounts))
    }
}

impl FsOps for FakeHal {
    fn is_block_device(&self, path: &Path) -> bool {
        self.state.lock().unwrap().block_devices.contains(path)
    }

    fn check_access(&self, path: &Path, write: bool) -> HalResult<()> {
        let state = self.state.lock().unwrap();
        if !path.exists() {
            return Err(HalError::Nix(Errno::ENOENT));
        }
        if state.denied.contains(path) || (write && state.write_denied.contains(path)) {
            return Err(HalError::PermissionDenied);
        }
        Ok(())
    }

    fn create_dir(&self, path: &Path, mode: u32) -> HalResult<()> {
        self.record_operation(Operation::CreateDir {
            path: path.to_path_buf(),
            mode,
        });
        let mut state = self.state.lock().unwrap();
        if state.denied.contains(path) {
            return Err(HalError::PermissionDenied);
        }
        state.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn scan_loop_devices(&self) -> HalResult<Vec<LoopSysfsInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .bindings
            .iter()
            .map(|(index, binding)| LoopSysfsInfo {
                name: format!("loop{}", index),
                index: *index,
                dev_path: device_path(*index),
                backing_file: binding.backing.clone(),
                offset: 0,
                autoclear: binding.flags.autoclear,
                part_scan: binding.flags.part_scan,
                read_only: binding.flags.read_only,
            })
            .collect())
    }
}
