use crate::{LoopNode, LoopOps};
use nix::errno::Errno;

/// RAII guard that clears a loop device binding when dropped.
#[derive(Debug)]
pub struct BindGuard<'a, H: LoopOps + ?Sized> {
    hal: &'a H,
    node: &'a H::Node,
    active: bool,
}

impl<'a, H: LoopOps + ?Sized> BindGuard<'a, H> {
    pub fn new(hal: &'a H, node: &'a H::Node) -> Self {
        Self {
            hal,
            node,
            active: true,
        }
    }

    /// Keep the binding and return the node it protects.
    pub fn release(mut self) -> &'a H::Node {
        self.active = false;
        self.node
    }

    pub fn node(&self) -> &H::Node {
        self.node
    }
}

impl<'a, H: LoopOps + ?Sized> Drop for BindGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        log::warn!("unwinding binding of {}", self.node.path().display());
        match self.hal.detach(self.node) {
            Ok(()) => {}
            // Never got as far as setting the fd.
            Err(err) if err.errno() == Some(Errno::ENXIO) => {
                log::debug!("{} was not bound", self.node.path().display());
            }
            Err(err) => {
                log::warn!(
                    "bind guard failed to clear {}: {}",
                    self.node.path().display(),
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FakeHal, LoopFlags, Operation};
    use std::fs::File;
    use std::path::Path;
    use tempfile::tempdir;

    fn bound_node(hal: &FakeHal) -> (tempfile::TempDir, crate::FakeLoopNode) {
        let dir = tempdir().unwrap();
        let image = dir.path().join("image.img");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();

        let index = hal.free_index().unwrap();
        let node = hal
            .open_node(Path::new(&format!("/dev/loop{}", index)))
            .unwrap();
        let backing = File::open(&image).unwrap();
        hal.attach(&node, &backing, &image, LoopFlags::new()).unwrap();
        (dir, node)
    }

    #[test]
    fn bind_guard_clears_on_drop() {
        let hal = FakeHal::new();
        let (_dir, node) = bound_node(&hal);

        {
            let _guard = BindGuard::new(&hal, &node);
        }

        assert!(hal.status(&node).unwrap().is_none());
        assert!(hal.has_operation(|op| matches!(op, Operation::Detach { .. })));
    }

    #[test]
    fn bind_guard_release_keeps_binding() {
        let hal = FakeHal::new();
        let (_dir, node) = bound_node(&hal);

        {
            let guard = BindGuard::new(&hal, &node);
            let _ = guard.release();
        }

        assert!(hal.status(&node).unwrap().is_some());
        assert!(!hal.has_operation(|op| matches!(op, Operation::Detach { .. })));
    }
}
