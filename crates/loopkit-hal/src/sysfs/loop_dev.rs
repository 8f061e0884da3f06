//! Helpers related to loop devices in sysfs.

use crate::path::parse_loop_index;
use crate::HalResult;
use std::fs;
use std::path::{Path, PathBuf};

/// Bound loop device as reported under `/sys/block/loopN/loop/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSysfsInfo {
    pub name: String,
    pub index: u32,
    pub dev_path: PathBuf,
    pub backing_file: PathBuf,
    pub offset: u64,
    pub autoclear: bool,
    pub part_scan: bool,
    pub read_only: bool,
}

pub fn scan_loop_devices_in(sys_block_root: &Path, dev_dir: &Path) -> HalResult<Vec<LoopSysfsInfo>> {
    let mut out = Vec::new();
    let entries = fs::read_dir(sys_block_root)?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let index = match parse_loop_index(&name, "loop") {
            Some(v) => v,
            None => continue,
        };
        let sysfs_path = sys_block_root.join(&name);
        // Only bound devices expose loop/backing_file.
        let backing_file = match read_trimmed(sysfs_path.join("loop/backing_file")) {
            Some(v) => PathBuf::from(v),
            None => continue,
        };
        let offset = read_trimmed(sysfs_path.join("loop/offset"))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        out.push(LoopSysfsInfo {
            dev_path: dev_dir.join(&name),
            name,
            index,
            backing_file,
            offset,
            autoclear: read_flag(sysfs_path.join("loop/autoclear")),
            part_scan: read_flag(sysfs_path.join("loop/partscan")),
            read_only: read_flag(sysfs_path.join("ro")),
        });
    }
    out.sort_by_key(|info| info.index);
    Ok(out)
}

fn read_flag(path: PathBuf) -> bool {
    read_trimmed(path)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        == 1
}

fn read_trimmed(path: PathBuf) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
