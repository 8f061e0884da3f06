pub mod mounts;

pub use mounts::MountRecord;
