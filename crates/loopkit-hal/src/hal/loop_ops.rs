//! Loop device operations (loop-control allocation, bind, unbind, status).

use crate::HalResult;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const LO_FLAGS_READ_ONLY: u32 = 1;
pub const LO_FLAGS_AUTOCLEAR: u32 = 4;
pub const LO_FLAGS_PARTSCAN: u32 = 8;
pub const LO_FLAGS_DIRECT_IO: u32 = 16;

/// Flags applied to a loop device when it is bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopFlags {
    pub read_only: bool,
    pub autoclear: bool,
    pub part_scan: bool,
    pub direct_io: bool,
}

impl LoopFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn autoclear(mut self, autoclear: bool) -> Self {
        self.autoclear = autoclear;
        self
    }

    pub fn part_scan(mut self, part_scan: bool) -> Self {
        self.part_scan = part_scan;
        self
    }

    pub fn direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }

    /// Kernel `lo_flags` representation.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.read_only {
            bits |= LO_FLAGS_READ_ONLY;
        }
        if self.autoclear {
            bits |= LO_FLAGS_AUTOCLEAR;
        }
        if self.part_scan {
            bits |= LO_FLAGS_PARTSCAN;
        }
        if self.direct_io {
            bits |= LO_FLAGS_DIRECT_IO;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            read_only: bits & LO_FLAGS_READ_ONLY != 0,
            autoclear: bits & LO_FLAGS_AUTOCLEAR != 0,
            part_scan: bits & LO_FLAGS_PARTSCAN != 0,
            direct_io: bits & LO_FLAGS_DIRECT_IO != 0,
        }
    }
}

/// Kernel view of a bound loop device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopStatus {
    pub index: u32,
    pub backing_file: PathBuf,
    pub offset: u64,
    pub size_limit: u64,
    pub flags: LoopFlags,
}

/// An open handle on a loop device node (`/dev/loopN`).
pub trait LoopNode {
    fn index(&self) -> u32;
    fn path(&self) -> &Path;
}

pub trait LoopOps {
    type Node: LoopNode;

    /// Ask the loop-control device for the next unused index (`LOOP_CTL_GET_FREE`).
    fn free_index(&self) -> HalResult<u32>;

    /// Open a loop device node once. Callers own any retry policy.
    fn open_node(&self, path: &Path) -> HalResult<Self::Node>;

    /// Bind `backing` to the node and apply `flags` in one step.
    ///
    /// `backing_path` is only recorded in the kernel status block.
    fn attach(
        &self,
        node: &Self::Node,
        backing: &File,
        backing_path: &Path,
        flags: LoopFlags,
    ) -> HalResult<()>;

    /// Clear the backing association (`LOOP_CLR_FD`).
    fn detach(&self, node: &Self::Node) -> HalResult<()>;

    /// Query the binding. `None` means the device is not bound.
    fn status(&self, node: &Self::Node) -> HalResult<Option<LoopStatus>>;
}
