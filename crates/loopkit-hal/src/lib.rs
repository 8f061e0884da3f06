//! loopkit Hardware Abstraction Layer (HAL).
//!
//! Everything that touches the kernel or the filesystem lives behind the
//! traits in [`hal`]. [`LinuxHal`] issues the real ioctls and mount calls;
//! [`FakeHal`] simulates them in memory for tests.

pub mod hal;
pub mod path;
pub mod procfs;
pub mod sysfs;

pub use hal::{
    BindGuard, FakeHal, FakeLoopNode, FsOps, LinuxHal, LinuxLoopNode, LoopFlags, LoopHal,
    LoopNode, LoopOps, LoopStatus, MountOps, MountOptions, MountTableOps, Operation,
};
pub use loopkit_error::{HalError, HalResult};
pub use procfs::MountRecord;
pub use sysfs::LoopSysfsInfo;
