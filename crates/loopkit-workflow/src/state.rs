//! Device lifecycle states.
//!
//! A loop device is only ever observed in one of three states. Mounting
//! requires a binding, so `Free -> Mounted` and `Mounted -> Free` are
//! rejected; teardown always passes through `Bound`.

use loopkit_error::{LoopError, LoopResult};
use loopkit_hal::{LoopFlags, LoopStatus};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Free,
    Bound,
    Mounted,
}

impl DeviceState {
    /// Validate a move to `to`, returning the new state.
    pub fn transition(self, to: DeviceState) -> LoopResult<DeviceState> {
        use DeviceState::*;
        match (self, to) {
            (Free, Bound) | (Bound, Mounted) | (Mounted, Bound) | (Bound, Free) => Ok(to),
            (from, to) => Err(LoopError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Free => "free",
            DeviceState::Bound => "bound",
            DeviceState::Mounted => "mounted",
        };
        f.write_str(name)
    }
}

/// Observed view of one loop device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    pub index: u32,
    pub path: PathBuf,
    pub backing_file: Option<PathBuf>,
    pub flags: LoopFlags,
    pub mounted_at: Option<PathBuf>,
}

impl LoopDevice {
    pub fn free(index: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            path: path.into(),
            backing_file: None,
            flags: LoopFlags::default(),
            mounted_at: None,
        }
    }

    pub fn from_status(path: impl Into<PathBuf>, status: LoopStatus) -> Self {
        Self {
            index: status.index,
            path: path.into(),
            backing_file: Some(status.backing_file),
            flags: status.flags,
            mounted_at: None,
        }
    }

    pub fn with_mount(mut self, mounted_at: Option<PathBuf>) -> Self {
        self.mounted_at = mounted_at;
        self
    }

    pub fn state(&self) -> DeviceState {
        match (&self.backing_file, &self.mounted_at) {
            (None, _) => DeviceState::Free,
            (Some(_), None) => DeviceState::Bound,
            (Some(_), Some(_)) => DeviceState::Mounted,
        }
    }
}
