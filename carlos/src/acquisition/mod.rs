//! Sweep-and-capture for one recording.

pub mod disk;
mod engine;

pub use disk::{DiskSpaceProbe, DiskSpaceStatus, SystemDiskProbe, check_disk_space};
pub use engine::{AcquisitionConfig, AcquisitionEngine, AcquisitionReport};
