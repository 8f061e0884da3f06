//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for loop-device and mount operations and
//! provides both real (LinuxHal) and fake (FakeHal) implementations.

pub mod fake_hal;
pub mod fs_ops;
pub mod guards;
pub mod linux_hal;
pub mod loop_ops;
pub mod mount_ops;

pub use fake_hal::{FakeHal, FakeLoopNode, Operation};
pub use fs_ops::FsOps;
pub use guards::BindGuard;
pub use linux_hal::{LinuxHal, LinuxLoopNode};
pub use loop_ops::{LoopFlags, LoopNode, LoopOps, LoopStatus};
pub use mount_ops::{MountOps, MountOptions, MountTableOps};

/// Complete HAL combining all system operation traits.
pub trait LoopHal: LoopOps + MountOps + MountTableOps + FsOps + Send + Sync {}

/// Automatically implement LoopHal for any type implementing all required traits.
impl<T> LoopHal for T where T: LoopOps + MountOps + MountTableOps + FsOps + Send + Sync {}
