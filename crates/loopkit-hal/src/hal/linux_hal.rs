//! Linux HAL implementation using real system calls.

use super::{FsOps, LoopFlags, LoopNode, LoopOps, LoopStatus, MountOps, MountOptions, MountTableOps};
use crate::sysfs::{loop_dev, LoopSysfsInfo};
use crate::{HalError, HalResult};
use nix::errno::Errno;
use nix::unistd::AccessFlags;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt};
use std::path::{Path, PathBuf};

#[cfg(all(not(target_os = "android"), not(target_env = "musl")))]
type IoctlRequest = libc::c_ulong;
#[cfg(any(target_os = "android", target_env = "musl"))]
type IoctlRequest = libc::c_int;

/// Loop control interface IOCTLs.
const LOOP_CTL_GET_FREE: IoctlRequest = 0x4C82;

/// Loop device IOCTLs.
const LOOP_SET_FD: IoctlRequest = 0x4C00;
const LOOP_CLR_FD: IoctlRequest = 0x4C01;
const LOOP_SET_STATUS64: IoctlRequest = 0x4C04;
const LOOP_GET_STATUS64: IoctlRequest = 0x4C05;
const LOOP_CONFIGURE: IoctlRequest = 0x4C0A;

const LO_NAME_SIZE: usize = 64;

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone)]
pub struct LinuxHal {
    loop_control: PathBuf,
    mount_table: PathBuf,
    sys_block: PathBuf,
    dev_dir: PathBuf,
}

impl Default for LinuxHal {
    fn default() -> Self {
        Self {
            loop_control: PathBuf::from("/dev/loop-control"),
            mount_table: PathBuf::from("/proc/self/mounts"),
            sys_block: PathBuf::from("/sys/block"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

impl LinuxHal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loop_control(mut self, path: impl Into<PathBuf>) -> Self {
        self.loop_control = path.into();
        self
    }

    pub fn mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    pub fn sys_block(mut self, path: impl Into<PathBuf>) -> Self {
        self.sys_block = path.into();
        self
    }

    pub fn dev_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.dev_dir = path.into();
        self
    }

    fn sysfs_backing_file(&self, index: u32) -> Option<PathBuf> {
        let path = self
            .sys_block
            .join(format!("loop{}", index))
            .join("loop/backing_file");
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }
}

/// Open `/dev/loopN` node.
#[derive(Debug)]
pub struct LinuxLoopNode {
    file: File,
    path: PathBuf,
    index: u32,
}

impl LoopNode for LinuxLoopNode {
    fn index(&self) -> u32 {
        self.index
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for LinuxLoopNode {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.file.as_raw_fd()
    }
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; 32],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; 32],
            lo_init: [0; 2],
        }
    }
}

impl LoopInfo64 {
    fn for_backing(backing_path: &Path, flags: LoopFlags) -> Self {
        let mut info = Self {
            lo_flags: flags.bits(),
            ..Default::default()
        };
        let name = backing_path.as_os_str().as_bytes();
        // Leave room for the trailing NUL, as losetup does.
        let len = name.len().min(LO_NAME_SIZE - 1);
        info.lo_file_name[..len].copy_from_slice(&name[..len]);
        info
    }

    fn file_name(&self) -> PathBuf {
        let end = self
            .lo_file_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(LO_NAME_SIZE);
        PathBuf::from(String::from_utf8_lossy(&self.lo_file_name[..end]).to_string())
    }
}

#[allow(dead_code)]
#[repr(C)]
struct LoopConfig {
    fd: u32,
    block_size: u32,
    info: LoopInfo64,
    reserved: [u64; 8],
}

fn map_nix_err(err: Errno) -> HalError {
    match err {
        Errno::EBUSY => HalError::DiskBusy,
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        other => HalError::Nix(other),
    }
}

impl LinuxHal {
    fn configure_legacy(&self, node: &LinuxLoopNode, backing: &File, info: &LoopInfo64) -> HalResult<()> {
        Errno::result(unsafe {
            libc::ioctl(
                node.as_raw_fd(),
                LOOP_SET_FD as IoctlRequest,
                backing.as_raw_fd() as libc::c_int,
            )
        })
        .map_err(map_nix_err)?;

        let result = Errno::result(unsafe {
            libc::ioctl(
                node.as_raw_fd(),
                LOOP_SET_STATUS64 as IoctlRequest,
                info as *const LoopInfo64,
            )
        });
        if let Err(err) = result {
            // fd set but status unset leaves the device busy for everyone else.
            let _ = self.detach(node);
            return Err(map_nix_err(err));
        }
        Ok(())
    }
}

impl LoopOps for LinuxHal {
    type Node = LinuxLoopNode;

    fn free_index(&self) -> HalResult<u32> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.loop_control)?;
        let index = Errno::result(unsafe {
            libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as IoctlRequest)
        })?;
        Ok(index as u32)
    }

    fn open_node(&self, path: &Path) -> HalResult<LinuxLoopNode> {
        let index = path
            .file_name()
            .and_then(|name| crate::path::parse_loop_index(&name.to_string_lossy(), "loop"))
            .ok_or_else(|| HalError::Parse(format!("not a loop device node: {}", path.display())))?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(LinuxLoopNode {
            file,
            path: path.to_path_buf(),
            index,
        })
    }

    fn attach(
        &self,
        node: &LinuxLoopNode,
        backing: &File,
        backing_path: &Path,
        flags: LoopFlags,
    ) -> HalResult<()> {
        let info = LoopInfo64::for_backing(backing_path, flags);
        let config = LoopConfig {
            fd: backing.as_raw_fd() as u32,
            block_size: 0,
            info: info.clone(),
            reserved: [0; 8],
        };

        let result = Errno::result(unsafe {
            libc::ioctl(
                node.as_raw_fd(),
                LOOP_CONFIGURE as IoctlRequest,
                &config as *const LoopConfig,
            )
        });
        match result {
            Ok(_) => Ok(()),
            // Kernels before 5.8 have no LOOP_CONFIGURE.
            Err(Errno::EINVAL) | Err(Errno::ENOTTY) => {
                log::debug!(
                    "LOOP_CONFIGURE unsupported on {}, falling back to SET_FD + SET_STATUS64",
                    node.path.display()
                );
                self.configure_legacy(node, backing, &info)
            }
            Err(err) => Err(map_nix_err(err)),
        }
    }

    fn detach(&self, node: &LinuxLoopNode) -> HalResult<()> {
        Errno::result(unsafe { libc::ioctl(node.as_raw_fd(), LOOP_CLR_FD as IoctlRequest, 0) })?;
        Ok(())
    }

    fn status(&self, node: &LinuxLoopNode) -> HalResult<Option<LoopStatus>> {
        let mut info = LoopInfo64::default();
        let result = Errno::result(unsafe {
            libc::ioctl(
                node.as_raw_fd(),
                LOOP_GET_STATUS64 as IoctlRequest,
                &mut info as *mut LoopInfo64,
            )
        });
        match result {
            Ok(_) => {}
            Err(Errno::ENXIO) => return Ok(None),
            Err(err) => return Err(HalError::Nix(err)),
        }

        // lo_file_name is truncated; sysfs has the full path when available.
        let backing_file = self
            .sysfs_backing_file(node.index)
            .unwrap_or_else(|| info.file_name());
        Ok(Some(LoopStatus {
            index: info.lo_number,
            backing_file,
            offset: info.lo_offset,
            size_limit: info.lo_sizelimit,
            flags: LoopFlags::from_bits(info.lo_flags),
        }))
    }
}

impl MountOps for LinuxHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        options: &MountOptions,
    ) -> HalResult<()> {
        let mut flags = nix::mount::MsFlags::empty();
        if options.read_only {
            flags |= nix::mount::MsFlags::MS_RDONLY;
        }
        let data = options.data.as_deref();

        nix::mount::mount(Some(device), target, Some(fstype), flags, data).map_err(map_nix_err)?;

        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        nix::mount::umount2(target, nix::mount::MntFlags::empty()).map_err(map_nix_err)?;

        Ok(())
    }
}

impl MountTableOps for LinuxHal {
    fn mount_table_path(&self) -> &Path {
        &self.mount_table
    }

    fn read_mount_table(&self) -> HalResult<String> {
        Ok(fs::read_to_string(&self.mount_table)?)
    }
}

impl FsOps for LinuxHal {
    fn is_block_device(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn check_access(&self, path: &Path, write: bool) -> HalResult<()> {
        nix::unistd::access(path, AccessFlags::F_OK)?;
        let mut mode = AccessFlags::R_OK;
        if write {
            mode |= AccessFlags::W_OK;
        }
        nix::unistd::access(path, mode)?;
        Ok(())
    }

    fn create_dir(&self, path: &Path, mode: u32) -> HalResult<()> {
        DirBuilder::new().recursive(true).mode(mode).create(path)?;
        Ok(())
    }

    fn scan_loop_devices(&self) -> HalResult<Vec<LoopSysfsInfo>> {
        loop_dev::scan_loop_devices_in(&self.sys_block, &self.dev_dir)
    }
}
