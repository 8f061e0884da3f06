use nix::errno::Errno;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type HalResult<T> = Result<T, HalError>;
pub type LoopResult<T> = Result<T, LoopError>;

/// Low-level failures from the world-touching layer (ioctls, syscalls, files).
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Device is busy (mounted or in use)")]
    DiskBusy,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("nix errno: {0}")]
    Nix(#[from] Errno),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

impl HalError {
    /// The underlying errno, when the failure came from the kernel.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            HalError::DiskBusy => Some(Errno::EBUSY),
            HalError::PermissionDenied => Some(Errno::EACCES),
            HalError::Nix(errno) => Some(*errno),
            HalError::Io(err) => err.raw_os_error().map(Errno::from_raw),
            HalError::Parse(_) | HalError::Other(_) => None,
        }
    }
}

/// Broad classes the CLI and callers use to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InputInvalid,
    ResourceExhausted,
    TransientUnavailable,
    KernelOperationFailed,
    ExternalOperationFailed,
    StateInconsistent,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::InputInvalid => "input invalid",
            ErrorCategory::ResourceExhausted => "resource exhausted",
            ErrorCategory::TransientUnavailable => "transiently unavailable",
            ErrorCategory::KernelOperationFailed => "kernel operation failed",
            ErrorCategory::ExternalOperationFailed => "external operation failed",
            ErrorCategory::StateInconsistent => "state inconsistent",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Backing file {} is not accessible: {reason}", .path.display())]
    BackingFileInaccessible { path: PathBuf, reason: String },

    #[error("{0} is not a loop device")]
    NotALoopDevice(String),

    #[error("No free loop device available: {0}")]
    NoFreeDevice(#[source] HalError),

    #[error("Loop device node {} unavailable after {attempts} attempt(s): {source}", .path.display())]
    DeviceNodeUnavailable {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: HalError,
    },

    #[error("Failed to bind {device}: {source}")]
    BindFailed {
        device: String,
        #[source]
        source: HalError,
    },

    #[error("Failed to unbind {device}: {source}")]
    UnbindFailed {
        device: String,
        #[source]
        source: HalError,
    },

    #[error("Failed to query status of {device}: {source}")]
    StatusFailed {
        device: String,
        #[source]
        source: HalError,
    },

    #[error("Failed to mount {device} on {}: {source}", .target.display())]
    MountFailed {
        device: String,
        target: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("Failed to unmount {}: {source}", .target.display())]
    UnmountFailed {
        target: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("Failed to create mount point {}: {source}", .path.display())]
    CreateMountPointFailed {
        path: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("Mount table {} unavailable: {source}", .path.display())]
    TableUnavailable {
        path: PathBuf,
        #[source]
        source: HalError,
    },

    #[error("No such mount point: {}", .0.display())]
    NoSuchMountPoint(PathBuf),

    #[error("Invalid device state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Hal(#[from] HalError),
}

impl LoopError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LoopError::BackingFileInaccessible { .. } | LoopError::NotALoopDevice(_) => {
                ErrorCategory::InputInvalid
            }
            LoopError::NoFreeDevice(_) => ErrorCategory::ResourceExhausted,
            LoopError::DeviceNodeUnavailable { .. } => ErrorCategory::TransientUnavailable,
            LoopError::BindFailed { .. }
            | LoopError::UnbindFailed { .. }
            | LoopError::StatusFailed { .. }
            | LoopError::Hal(_) => ErrorCategory::KernelOperationFailed,
            LoopError::MountFailed { .. }
            | LoopError::UnmountFailed { .. }
            | LoopError::CreateMountPointFailed { .. } => ErrorCategory::ExternalOperationFailed,
            LoopError::TableUnavailable { .. }
            | LoopError::NoSuchMountPoint(_)
            | LoopError::InvalidTransition { .. } => ErrorCategory::StateInconsistent,
        }
    }

    /// Short name of the lifecycle step that failed.
    pub fn step(&self) -> &'static str {
        match self {
            LoopError::BackingFileInaccessible { .. } => "validate",
            LoopError::NotALoopDevice(_) => "classify",
            LoopError::NoFreeDevice(_) => "allocate",
            LoopError::DeviceNodeUnavailable { .. } => "open",
            LoopError::BindFailed { .. } => "bind",
            LoopError::UnbindFailed { .. } => "unbind",
            LoopError::StatusFailed { .. } => "status",
            LoopError::MountFailed { .. } | LoopError::CreateMountPointFailed { .. } => "mount",
            LoopError::UnmountFailed { .. } => "unmount",
            LoopError::TableUnavailable { .. } | LoopError::NoSuchMountPoint(_) => "discover",
            LoopError::InvalidTransition { .. } => "transition",
            LoopError::Hal(_) => "kernel",
        }
    }
}
