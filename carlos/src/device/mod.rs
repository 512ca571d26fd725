//! Receiver capability.
//!
//! The acquisition engine only talks to hardware through [`DeviceBackend`]
//! and the [`Receiver`] session it hands out. Two backends exist: the
//! `rtl_sdr` command-line tool and a simulated receiver that writes noise.

pub mod rtl_sdr;
pub mod simulated;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{DeviceBackendKind, DeviceConfig};
use crate::{Error, Result};

pub use rtl_sdr::RtlSdrBackend;
pub use simulated::SimulatedBackend;

/// A receiver that can be opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub index: u32,
    pub name: String,
    pub serial: Option<String>,
}

/// Tuner parameters applied in one `configure` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunerSettings {
    pub sample_rate_hz: u32,
    pub frequency_hz: u32,
    /// `0` lets the tuner pick.
    pub bandwidth_hz: u32,
    /// `0.0` selects automatic gain.
    pub gain_db: f64,
    pub bias_tee: bool,
}

impl TunerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_hz == 0 {
            return Err(Error::device("sample rate must be positive"));
        }
        if self.frequency_hz == 0 {
            return Err(Error::device("center frequency must be positive"));
        }
        if !self.gain_db.is_finite() {
            return Err(Error::device("gain must be a finite number"));
        }
        Ok(())
    }
}

/// What one capture produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub bytes_written: u64,
    pub elapsed: Duration,
    /// `false` when the receiver stopped before the requested duration.
    pub completed: bool,
}

/// Source of receivers.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Receivers currently attached. Empty means no hardware, not an error.
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open and fully configure receiver `index`, or fail without leaving a
    /// half-configured session behind.
    async fn configure(&self, index: u32, settings: &TunerSettings) -> Result<Box<dyn Receiver>>;
}

/// An open, configured receiver.
#[async_trait]
pub trait Receiver: Send {
    /// Write raw samples to `dest` for up to `duration`. Returns early, with
    /// `completed == false`, if the device stops delivering samples.
    async fn capture_for(&mut self, dest: &Path, duration: Duration) -> Result<CaptureStats>;

    /// Release the receiver. Safe to call more than once.
    async fn close(&mut self);
}

/// Build the backend selected in the configuration.
pub fn backend_from_config(config: &DeviceConfig) -> Arc<dyn DeviceBackend> {
    match config.backend {
        DeviceBackendKind::RtlSdr => Arc::new(RtlSdrBackend::new(
            config.rtl_sdr_path.clone(),
            config.rtl_test_path.clone(),
        )),
        DeviceBackendKind::Simulated => Arc::new(SimulatedBackend::new()),
    }
}
