use anyhow::{bail, Context, Result};
use clap::Parser;
use loopkit_hal::LoopHal;
use loopkit_workflow::{LifecycleOrchestrator, LoopDevice, LoopError, LoopkitConfig, MountRequest};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

mod cli;
mod logging;

use cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if cli.command.needs_root() && !nix::unistd::geteuid().is_root() {
        bail!("loopkit must be run as root (try sudo)");
    }

    let mut config = match &cli.config {
        Some(path) => LoopkitConfig::load(path)?,
        None => LoopkitConfig::default(),
    };
    if cli.no_part_scan {
        config.part_scan = false;
    }
    if cli.read_only {
        config.read_only = true;
    }

    let lifecycle = LifecycleOrchestrator::new(config.linux_hal(), config);
    run(&lifecycle, cli.command)
}

fn run<H: LoopHal>(lifecycle: &LifecycleOrchestrator<H>, command: Command) -> Result<()> {
    match command {
        Command::Add { image } => {
            let image = absolute(&image)?;
            let device = lifecycle.create(&image).map_err(step_failed)?;
            println!("{}", device.path.display());
        }
        Command::Remove { path } => {
            let path = absolute(&path)?;
            lifecycle.remove(&path).map_err(step_failed)?;
        }
        Command::Mount {
            source,
            mount_point,
            fstype,
            partition,
            options,
        } => {
            let source = absolute(&source)?;
            let mount_point = absolute(&mount_point)?;
            let mut request = MountRequest::new(&mount_point).partition(partition);
            if let Some(fstype) = fstype.as_deref() {
                request = request.fstype(fstype);
            }
            if let Some(options) = options.as_deref() {
                request = request.options(options);
            }
            let device = lifecycle.mount(&source, &request).map_err(step_failed)?;
            println!("{}", describe(&device));
        }
        Command::Umount { mount_point } => {
            let mount_point = absolute(&mount_point)?;
            lifecycle.unmount(&mount_point).map_err(step_failed)?;
        }
        Command::Status { device } => {
            let device = absolute(&device)?;
            let device = lifecycle.status(&device).map_err(step_failed)?;
            println!("{}", describe(&device));
        }
        Command::List => {
            for device in lifecycle.list().map_err(step_failed)? {
                println!("{}", describe(&device));
            }
        }
        Command::Find { mount_point } => {
            let mount_point = absolute(&mount_point)?;
            let device = lifecycle
                .discovery()
                .find_device_for_mount_point(&mount_point)
                .map_err(step_failed)?
                .ok_or_else(|| step_failed(LoopError::NoSuchMountPoint(mount_point.clone())))?;
            println!("{}", device);
        }
    }
    Ok(())
}

fn step_failed(err: LoopError) -> anyhow::Error {
    let context = format!("{} step failed ({})", err.step(), err.category());
    anyhow::Error::new(err).context(context)
}

/// Resolve `path` against the working directory. Existing paths are
/// canonicalized so they compare equal to mount-table entries.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return fs::canonicalize(path)
            .with_context(|| format!("Failed to resolve path: {}", path.display()));
    }
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}

fn describe(device: &LoopDevice) -> String {
    let mut line = format!("{}: {}", device.path.display(), device.state());
    if let Some(backing) = &device.backing_file {
        line.push_str(&format!(" {}", backing.display()));
    }
    let mut flags = Vec::new();
    if device.flags.part_scan {
        flags.push("partscan");
    }
    if device.flags.read_only {
        flags.push("ro");
    }
    if device.flags.autoclear {
        flags.push("autoclear");
    }
    if !flags.is_empty() {
        line.push_str(&format!(" [{}]", flags.join(",")));
    }
    if let Some(target) = &device.mounted_at {
        line.push_str(&format!(" on {}", target.display()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopkit_hal::FakeHal;
    use tempfile::tempdir;

    fn lifecycle(hal: &FakeHal) -> LifecycleOrchestrator<FakeHal> {
        let mut config = LoopkitConfig::default();
        config.retry.interval_ms = 0;
        LifecycleOrchestrator::new(hal.clone(), config)
    }

    #[test]
    fn absolute_canonicalizes_existing_paths() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a");
        fs::create_dir(&nested).unwrap();

        let resolved = absolute(&nested.join("../a")).unwrap();
        assert_eq!(resolved, fs::canonicalize(&nested).unwrap());
        assert_eq!(
            absolute(Path::new("/mnt/not-there")).unwrap(),
            PathBuf::from("/mnt/not-there")
        );
        assert!(absolute(Path::new("relative/not-there"))
            .unwrap()
            .is_absolute());
    }

    #[test]
    fn describe_lists_flags_and_mount() {
        let device = LoopDevice {
            index: 2,
            path: PathBuf::from("/dev/loop2"),
            backing_file: Some(PathBuf::from("/srv/disk.img")),
            flags: loopkit_hal::LoopFlags::new().part_scan(true).read_only(true),
            mounted_at: Some(PathBuf::from("/mnt/x")),
        };
        assert_eq!(
            describe(&device),
            "/dev/loop2: mounted /srv/disk.img [partscan,ro] on /mnt/x"
        );
        assert_eq!(
            describe(&LoopDevice::free(0, "/dev/loop0")),
            "/dev/loop0: free"
        );
    }

    #[test]
    fn add_then_remove_round_trip() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("img.bin");
        fs::write(&image, vec![0u8; 4096]).unwrap();
        let hal = FakeHal::new();
        let lifecycle = lifecycle(&hal);

        run(&lifecycle, Command::Add { image }).unwrap();
        assert_eq!(hal.bound_count(), 1);

        run(
            &lifecycle,
            Command::Remove {
                path: PathBuf::from("/dev/loop0"),
            },
        )
        .unwrap();
        assert_eq!(hal.bound_count(), 0);
    }

    #[test]
    fn find_reports_missing_mount_points() {
        let hal = FakeHal::new();
        let err = run(
            &lifecycle(&hal),
            Command::Find {
                mount_point: PathBuf::from("/mnt/nowhere"),
            },
        )
        .unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("discover step failed"));
        assert!(message.contains("/mnt/nowhere"));
    }
}
