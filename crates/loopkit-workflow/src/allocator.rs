//! Loop device allocation through loop-control.

use loopkit_error::{HalError, LoopError, LoopResult};
use loopkit_hal::LoopOps;
use nix::errno::Errno;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Bounded polling policy for operations that can fail transiently.
///
/// `retries` counts the attempts after the first one, so the default makes
/// 17 attempts with 16 sleeps in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 16,
            interval: Duration::from_millis(25),
        }
    }
}

/// Last error of a retried operation and how many attempts were made.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    pub error: E,
}

impl RetryPolicy {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }

    /// Total attempts the policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Run `op` until it succeeds, fails with an error `is_transient` rejects,
    /// or the retries are spent. Sleeps `interval` between attempts.
    pub fn run<T, E, F, P>(&self, mut op: F, is_transient: P) -> Result<T, RetryFailure<E>>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let budget = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(error) if attempt < budget && is_transient(&error) => {
                    log::debug!("attempt {}/{} failed: {}; retrying", attempt, budget, error);
                    thread::sleep(self.interval);
                    attempt += 1;
                }
                Err(error) => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    })
                }
            }
        }
    }
}

/// Permission and existence errors right after allocation are udev still
/// creating or chmod-ing the node.
fn is_transient_open_error(err: &HalError) -> bool {
    matches!(err.errno(), Some(Errno::EACCES) | Some(Errno::ENOENT))
}

pub struct LoopAllocator<'a, H: LoopOps + ?Sized> {
    hal: &'a H,
    device_prefix: String,
    retry: RetryPolicy,
}

impl<'a, H: LoopOps + ?Sized> LoopAllocator<'a, H> {
    pub fn new(hal: &'a H, device_prefix: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            hal,
            device_prefix: device_prefix.into(),
            retry,
        }
    }

    pub fn device_path(&self, index: u32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.device_prefix, index))
    }

    pub fn acquire_free_index(&self) -> LoopResult<u32> {
        let index = self.hal.free_index().map_err(LoopError::NoFreeDevice)?;
        log::debug!("loop-control handed out index {}", index);
        Ok(index)
    }

    pub fn open_device_node(&self, index: u32) -> LoopResult<H::Node> {
        let path = self.device_path(index);
        self.retry
            .run(|| self.hal.open_node(&path), is_transient_open_error)
            .map_err(|failure| LoopError::DeviceNodeUnavailable {
                path: path.clone(),
                attempts: failure.attempts,
                source: failure.error,
            })
    }

    pub fn allocate(&self) -> LoopResult<(u32, H::Node)> {
        let index = self.acquire_free_index()?;
        let node = self.open_device_node(index)?;
        Ok((index, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopkit_hal::{FakeHal, LoopNode, Operation};
    use std::cell::Cell;
    use std::path::Path;

    fn quick() -> RetryPolicy {
        RetryPolicy::new(16, Duration::from_millis(0))
    }

    fn open_attempts(hal: &FakeHal) -> usize {
        hal.operations()
            .iter()
            .filter(|op| matches!(op, Operation::OpenNode { .. }))
            .count()
    }

    #[test]
    fn default_policy_matches_udev_race_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retries, 16);
        assert_eq!(policy.max_attempts(), 17);
        assert_eq!(policy.interval, Duration::from_millis(25));
    }

    #[test]
    fn retry_stops_on_first_success() {
        let calls = Cell::new(0);
        let result: Result<u32, RetryFailure<String>> = quick().run(
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("busy".to_string())
                } else {
                    Ok(7)
                }
            },
            |_| true,
        );
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn zero_retries_still_runs_once() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(0, Duration::from_millis(0));
        let failure = policy
            .run(
                || -> Result<(), String> {
                    calls.set(calls.get() + 1);
                    Err("no".to_string())
                },
                |_| true,
            )
            .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert_eq!(failure.attempts, 1);
    }

    #[test]
    fn allocate_opens_the_handed_out_node() {
        let hal = FakeHal::new();
        let allocator = LoopAllocator::new(&hal, "/dev/loop", quick());

        let (index, node) = allocator.allocate().unwrap();
        assert_eq!(index, 0);
        assert_eq!(node.path(), Path::new("/dev/loop0"));
    }

    #[test]
    fn transient_open_errors_within_budget_succeed() {
        let hal = FakeHal::new();
        hal.fail_open_node([Errno::EACCES, Errno::ENOENT, Errno::EACCES]);
        let allocator = LoopAllocator::new(&hal, "/dev/loop", quick());

        let (_, node) = allocator.allocate().unwrap();
        assert_eq!(node.index(), 0);
        assert_eq!(open_attempts(&hal), 4);
    }

    #[test]
    fn node_ready_on_the_last_retry_is_opened() {
        let hal = FakeHal::new();
        hal.fail_open_node(std::iter::repeat(Errno::EACCES).take(16));
        let allocator = LoopAllocator::new(&hal, "/dev/loop", quick());

        let (_, node) = allocator.allocate().unwrap();
        assert_eq!(node.path(), Path::new("/dev/loop0"));
        assert_eq!(open_attempts(&hal), 17);
    }

    #[test]
    fn exhausted_budget_reports_attempts() {
        let hal = FakeHal::new();
        hal.fail_open_node(std::iter::repeat(Errno::EACCES).take(17));
        let allocator = LoopAllocator::new(&hal, "/dev/loop", quick());

        let err = allocator.allocate().unwrap_err();
        match err {
            LoopError::DeviceNodeUnavailable { path, attempts, .. } => {
                assert_eq!(path, PathBuf::from("/dev/loop0"));
                assert_eq!(attempts, 17);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(open_attempts(&hal), 17);
    }

    #[test]
    fn non_transient_error_aborts_immediately() {
        let hal = FakeHal::new();
        hal.fail_open_node([Errno::EIO]);
        let allocator = LoopAllocator::new(&hal, "/dev/loop", quick());

        let err = allocator.allocate().unwrap_err();
        assert!(matches!(
            err,
            LoopError::DeviceNodeUnavailable { attempts: 1, .. }
        ));
        assert_eq!(open_attempts(&hal), 1);
    }

    #[test]
    fn exhausted_loop_control_is_no_free_device() {
        let hal = FakeHal::new().with_max_devices(0);
        let allocator = LoopAllocator::new(&hal, "/dev/loop", quick());

        let err = allocator.acquire_free_index().unwrap_err();
        assert!(matches!(err, LoopError::NoFreeDevice(_)));
        assert_eq!(err.category(), loopkit_error::ErrorCategory::ResourceExhausted);
    }
}
