//! Runtime configuration, optionally loaded from a TOML file.
//!
//! Every field has a default, so an empty file (or no file) yields the
//! stock Linux paths and the usual node-open budget of 16 retries 25ms apart.

use crate::allocator::RetryPolicy;
use anyhow::{Context, Result};
use loopkit_hal::{LinuxHal, LoopFlags};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first node-open attempt.
    pub retries: u32,
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            retries: policy.retries,
            interval_ms: policy.interval.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopkitConfig {
    pub loop_control: PathBuf,
    /// Device nodes are `<device_prefix><index>`.
    pub device_prefix: String,
    pub mount_table: PathBuf,
    pub sys_block: PathBuf,
    pub retry: RetryConfig,
    pub part_scan: bool,
    pub read_only: bool,
    pub autoclear: bool,
    pub default_fstype: String,
    pub mount_dir_mode: u32,
    /// Refuse to unmount or unbind anything that does not look like a loop device.
    pub require_loop_device: bool,
}

impl Default for LoopkitConfig {
    fn default() -> Self {
        Self {
            loop_control: PathBuf::from("/dev/loop-control"),
            device_prefix: "/dev/loop".to_string(),
            mount_table: PathBuf::from("/proc/self/mounts"),
            sys_block: PathBuf::from("/sys/block"),
            retry: RetryConfig::default(),
            part_scan: true,
            read_only: false,
            autoclear: false,
            default_fstype: "ext2".to_string(),
            mount_dir_mode: 0o755,
            require_loop_device: true,
        }
    }
}

impl LoopkitConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn loop_flags(&self) -> LoopFlags {
        LoopFlags::new()
            .part_scan(self.part_scan)
            .read_only(self.read_only)
            .autoclear(self.autoclear)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    /// Directory holding the device nodes, derived from `device_prefix`.
    pub fn dev_dir(&self) -> PathBuf {
        Path::new(&self.device_prefix)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/dev"))
    }

    /// A [`LinuxHal`] pointed at the configured kernel interfaces.
    pub fn linux_hal(&self) -> LinuxHal {
        LinuxHal::new()
            .loop_control(&self.loop_control)
            .mount_table(&self.mount_table)
            .sys_block(&self.sys_block)
            .dev_dir(self.dev_dir())
    }
}
