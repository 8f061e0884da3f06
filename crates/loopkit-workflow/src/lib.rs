//! loopkit workflow orchestration.
//!
//! This crate sequences the loop-device lifecycle on top of `loopkit-hal`:
//! mount-table discovery, allocation with a bounded node-open retry, binding,
//! and the create/mount/remove flows that tie them together.

pub mod allocator;
pub mod binder;
pub mod config;
pub mod discovery;
pub mod lifecycle;
pub mod state;

pub use allocator::{LoopAllocator, RetryFailure, RetryPolicy};
pub use binder::LoopBinder;
pub use config::{LoopkitConfig, RetryConfig};
pub use discovery::DeviceDiscovery;
pub use lifecycle::{LifecycleOrchestrator, MountRequest};
pub use state::{DeviceState, LoopDevice};

pub use loopkit_error::{ErrorCategory, LoopError, LoopResult};
