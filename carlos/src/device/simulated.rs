//! Simulated receiver for running without hardware.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::{Instant, sleep};

use super::{CaptureStats, DeviceBackend, DeviceDescriptor, Receiver, TunerSettings};
use crate::{Error, Result};

/// Upper bound on the noise written per second, whatever the sample rate.
const DEFAULT_MAX_BYTES_PER_SEC: u64 = 256 * 1024;
const WRITE_TICK: Duration = Duration::from_millis(50);

/// Hands out receivers that fill capture files with 8-bit I/Q noise.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    device_count: u32,
    max_bytes_per_sec: u64,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// One virtual receiver.
    pub fn new() -> Self {
        Self {
            device_count: 1,
            max_bytes_per_sec: DEFAULT_MAX_BYTES_PER_SEC,
        }
    }

    pub fn with_devices(mut self, device_count: u32) -> Self {
        self.device_count = device_count;
        self
    }

    pub fn with_max_bytes_per_sec(mut self, max_bytes_per_sec: u64) -> Self {
        self.max_bytes_per_sec = max_bytes_per_sec.max(1);
        self
    }
}

#[async_trait]
impl DeviceBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok((0..self.device_count)
            .map(|index| DeviceDescriptor {
                index,
                name: "Simulated receiver".to_string(),
                serial: Some(format!("SIM{:04}", index)),
            })
            .collect())
    }

    async fn configure(&self, index: u32, settings: &TunerSettings) -> Result<Box<dyn Receiver>> {
        settings.validate()?;
        if index >= self.device_count {
            return Err(Error::device(format!(
                "device index {} not present ({} attached)",
                index, self.device_count
            )));
        }

        // Two bytes (I and Q) per sample.
        let bytes_per_sec = (u64::from(settings.sample_rate_hz) * 2).min(self.max_bytes_per_sec);
        Ok(Box::new(SimulatedReceiver {
            bytes_per_sec,
            closed: false,
        }))
    }
}

pub struct SimulatedReceiver {
    bytes_per_sec: u64,
    closed: bool,
}

fn byte_budget(bytes_per_sec: u64, elapsed: Duration) -> u64 {
    (u128::from(bytes_per_sec) * elapsed.as_millis() / 1000) as u64
}

fn fill_noise(buf: &mut Vec<u8>, len: usize) {
    buf.clear();
    while buf.len() < len {
        buf.extend_from_slice(&rand::random::<u64>().to_le_bytes());
    }
    buf.truncate(len);
}

#[async_trait]
impl Receiver for SimulatedReceiver {
    async fn capture_for(&mut self, dest: &Path, duration: Duration) -> Result<CaptureStats> {
        if self.closed {
            return Err(Error::device("receiver already closed"));
        }

        let started = Instant::now();
        let deadline = started + duration;
        let mut file = BufWriter::new(tokio::fs::File::create(dest).await?);
        let mut written = 0u64;
        let mut chunk = Vec::new();

        loop {
            let now = Instant::now();
            let target = byte_budget(self.bytes_per_sec, (now - started).min(duration));
            if target > written {
                fill_noise(&mut chunk, (target - written) as usize);
                file.write_all(&chunk).await?;
                written = target;
            }
            if now >= deadline {
                break;
            }
            sleep(WRITE_TICK.min(deadline - now)).await;
        }

        file.flush().await?;
        Ok(CaptureStats {
            bytes_written: written,
            elapsed: started.elapsed(),
            completed: true,
        })
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
