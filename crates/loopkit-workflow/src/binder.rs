//! Binding backing files to loop devices, and clearing them again.

use loopkit_error::{HalError, LoopError, LoopResult};
use loopkit_hal::{BindGuard, FsOps, LoopFlags, LoopNode, LoopOps, LoopStatus};
use nix::errno::Errno;
use std::fs::OpenOptions;
use std::path::Path;

pub struct LoopBinder<'a, H: LoopOps + FsOps + ?Sized> {
    hal: &'a H,
}

fn device_name<N: LoopNode>(node: &N) -> String {
    node.path().display().to_string()
}

impl<'a, H: LoopOps + FsOps + ?Sized> LoopBinder<'a, H> {
    pub fn new(hal: &'a H) -> Self {
        Self { hal }
    }

    /// Check the backing file exists and grants the access a binding needs.
    pub fn validate_backing(&self, backing: &Path, read_only: bool) -> LoopResult<()> {
        self.hal
            .check_access(backing, !read_only)
            .map_err(|err| LoopError::BackingFileInaccessible {
                path: backing.to_path_buf(),
                reason: match err.errno() {
                    Some(Errno::ENOENT) => "no such file".to_string(),
                    Some(Errno::EACCES) if read_only => "not readable".to_string(),
                    Some(Errno::EACCES) => "not readable and writable".to_string(),
                    _ => err.to_string(),
                },
            })
    }

    /// Bind `backing` to `node` with `flags`.
    ///
    /// The returned guard clears the binding when dropped; call
    /// [`BindGuard::release`] once the binding should outlive the caller.
    /// A binding the kernel only half-applied is cleared before the error is
    /// returned.
    pub fn bind<'n>(
        &'n self,
        node: &'n H::Node,
        backing: &Path,
        flags: LoopFlags,
    ) -> LoopResult<BindGuard<'n, H>> {
        self.validate_backing(backing, flags.read_only)?;
        let file = OpenOptions::new()
            .read(true)
            .write(!flags.read_only)
            .open(backing)
            .map_err(|err| LoopError::BackingFileInaccessible {
                path: backing.to_path_buf(),
                reason: err.to_string(),
            })?;

        let guard = BindGuard::new(self.hal, node);
        if let Err(source) = self.hal.attach(node, &file, backing, flags) {
            if matches!(source, HalError::DiskBusy) {
                // Someone else's binding; leave it alone.
                guard.release();
            } else {
                drop(guard);
            }
            return Err(LoopError::BindFailed {
                device: device_name(node),
                source,
            });
        }

        log::info!(
            "bound {} to {} (flags {:#x})",
            backing.display(),
            node.path().display(),
            flags.bits()
        );
        Ok(guard)
    }

    pub fn status(&self, node: &H::Node) -> LoopResult<Option<LoopStatus>> {
        self.hal
            .status(node)
            .map_err(|source| LoopError::StatusFailed {
                device: device_name(node),
                source,
            })
    }

    /// Return the device to Free. A device that is already free is not an error.
    pub fn unbind(&self, node: &H::Node) -> LoopResult<()> {
        if self.status(node)?.is_none() {
            log::debug!("{} is already free", node.path().display());
            return Ok(());
        }
        match self.hal.detach(node) {
            Ok(()) => {}
            Err(err) if err.errno() == Some(Errno::ENXIO) => {
                log::debug!("{} was cleared concurrently", node.path().display());
            }
            Err(source) => {
                return Err(LoopError::UnbindFailed {
                    device: device_name(node),
                    source,
                })
            }
        }
        log::info!("unbound {}", node.path().display());
        Ok(())
    }
}
