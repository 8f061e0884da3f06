pub mod loop_dev;

pub use loop_dev::LoopSysfsInfo;
