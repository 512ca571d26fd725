//! Domain types for recordings and pointing sweeps.

pub mod recording;
pub mod sweep;

pub use recording::{
    NewRecording, OutputLayout, RecordingId, RecordingIdGenerator, RecordingOutcome,
    RecordingRequest, RecordingStatus, estimate_duration_ms,
};
pub use sweep::{Axis, SweepDescriptor, SweepError, SweepGrid, SweepPoint};
