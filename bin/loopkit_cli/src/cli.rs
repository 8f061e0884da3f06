//! CLI argument parsing for loopkit.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "loopkit")]
#[command(about = "Attach, mount and tear down loop devices backed by image files")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Do not ask the kernel to scan the image for partitions
    #[arg(long, global = true)]
    pub no_part_scan: bool,

    /// Bind and mount read-only
    #[arg(long, global = true)]
    pub read_only: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bind an image file to a free loop device and print the device path
    Add {
        image: PathBuf,
    },

    /// Unmount (if needed) and unbind a loop device, given the device or its mount point
    Remove {
        path: PathBuf,
    },

    /// Mount a loop device, or bind and mount an image file
    Mount {
        /// Loop device (e.g. /dev/loop0) or image file
        source: PathBuf,

        mount_point: PathBuf,

        /// Filesystem type (defaults to the configured type, ext2 out of the box)
        #[arg(long, short = 't')]
        fstype: Option<String>,

        /// Mount partition N of the device instead of the whole device
        #[arg(long, short = 'p')]
        partition: Option<u32>,

        /// Filesystem-specific mount options, comma separated
        #[arg(long, short = 'o')]
        options: Option<String>,
    },

    /// Unmount a mount point, leaving its loop device bound
    Umount {
        mount_point: PathBuf,
    },

    /// Show the binding and mount of a loop device
    Status {
        device: PathBuf,
    },

    /// List bound loop devices
    List,

    /// Print the device mounted at a mount point
    Find {
        mount_point: PathBuf,
    },
}

impl Command {
    /// Commands that only read kernel tables can run unprivileged.
    pub fn needs_root(&self) -> bool {
        !matches!(self, Command::List | Command::Find { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_accepts_partition_and_fstype() {
        let cli = Cli::try_parse_from([
            "loopkit",
            "mount",
            "/srv/disk.img",
            "/mnt/x",
            "--fstype",
            "vfat",
            "--partition",
            "2",
            "-o",
            "noatime",
        ])
        .unwrap();
        match cli.command {
            Command::Mount {
                source,
                mount_point,
                fstype,
                partition,
                options,
            } => {
                assert_eq!(options.as_deref(), Some("noatime"));
                assert_eq!(source, PathBuf::from("/srv/disk.img"));
                assert_eq!(mount_point, PathBuf::from("/mnt/x"));
                assert_eq!(fstype.as_deref(), Some("vfat"));
                assert_eq!(partition, Some(2));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["loopkit", "add", "disk.img", "--no-part-scan", "-v"])
            .unwrap();
        assert!(cli.no_part_scan);
        assert!(cli.verbose);
        assert!(!cli.read_only);
    }

    #[test]
    fn read_only_queries_skip_root() {
        assert!(!Command::List.needs_root());
        assert!(!Command::Find {
            mount_point: PathBuf::from("/mnt/x")
        }
        .needs_root());
        assert!(Command::Remove {
            path: PathBuf::from("/mnt/x")
        }
        .needs_root());
    }

    #[test]
    fn remove_requires_a_path() {
        assert!(Cli::try_parse_from(["loopkit", "remove"]).is_err());
    }
}
