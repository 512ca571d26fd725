//! `rtl_sdr` command-line backend.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rtlsdr_cli::{CaptureArgs, ListedDevice};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStderr;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, trace, warn};

use super::{CaptureStats, DeviceBackend, DeviceDescriptor, Receiver, TunerSettings};
use crate::{Error, Result};

/// `rtl_test -t` enumerates and exits; anything slower is a wedged device.
const LISTING_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the stderr reader once `rtl_sdr` has exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RtlSdrBackend {
    rtl_sdr_path: PathBuf,
    rtl_test_path: PathBuf,
}

impl RtlSdrBackend {
    pub fn new(rtl_sdr_path: impl Into<PathBuf>, rtl_test_path: impl Into<PathBuf>) -> Self {
        Self {
            rtl_sdr_path: rtl_sdr_path.into(),
            rtl_test_path: rtl_test_path.into(),
        }
    }

    async fn run_listing(&self) -> Result<String> {
        let mut cmd = rtlsdr_cli::listing_command(&self.rtl_test_path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        let output = timeout(LISTING_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::device("rtl_test did not exit while listing devices"))??;

        // rtl_test prints the listing on stderr.
        let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        Ok(text)
    }
}

fn descriptor(device: ListedDevice) -> DeviceDescriptor {
    let name = match (device.vendor.is_empty(), device.product.is_empty()) {
        (false, false) => format!("{} {}", device.vendor, device.product),
        (false, true) => device.vendor,
        _ => device.product,
    };
    DeviceDescriptor {
        index: device.index,
        name,
        serial: (!device.serial.is_empty()).then_some(device.serial),
    }
}

#[async_trait]
impl DeviceBackend for RtlSdrBackend {
    fn name(&self) -> &'static str {
        "rtl_sdr"
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let text = match self.run_listing().await {
            Ok(text) => text,
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "{} not found, reporting no devices",
                    self.rtl_test_path.display()
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let devices: Vec<_> = rtlsdr_cli::parse_device_listing(&text)
            .into_iter()
            .map(descriptor)
            .collect();
        debug!("rtl_test reported {} device(s)", devices.len());
        Ok(devices)
    }

    async fn configure(&self, index: u32, settings: &TunerSettings) -> Result<Box<dyn Receiver>> {
        settings.validate()?;

        let devices = self.list_devices().await?;
        let Some(device) = devices.iter().find(|d| d.index == index) else {
            return Err(Error::device(format!(
                "device index {} not present ({} attached)",
                index,
                devices.len()
            )));
        };

        if settings.bandwidth_hz != 0 {
            warn!(
                bandwidth_hz = settings.bandwidth_hz,
                "rtl_sdr has no bandwidth option, ignoring"
            );
        }

        info!(
            device = %device.name,
            index,
            frequency_hz = settings.frequency_hz,
            sample_rate_hz = settings.sample_rate_hz,
            gain_db = settings.gain_db,
            bias_tee = settings.bias_tee,
            "Receiver configured"
        );

        Ok(Box::new(RtlSdrReceiver {
            program: self.rtl_sdr_path.clone(),
            index,
            settings: *settings,
            closed: false,
        }))
    }
}

/// Read `rtl_sdr`'s stderr until it closes so the tool never blocks on a full
/// pipe. Returns the last non-empty line.
async fn drain_stderr(stderr: ChildStderr) -> Option<String> {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut last = None;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if !line.is_empty() {
                    trace!("rtl_sdr: {}", line);
                    last = Some(line.to_string());
                }
            }
            Err(e) => {
                debug!("Stopped reading rtl_sdr stderr: {}", e);
                break;
            }
        }
    }
    last
}

/// One configured receiver. Each capture is a separate `rtl_sdr` run.
pub struct RtlSdrReceiver {
    program: PathBuf,
    index: u32,
    settings: TunerSettings,
    closed: bool,
}

impl RtlSdrReceiver {
    fn capture_args(&self, dest: &Path) -> CaptureArgs {
        let mut args = CaptureArgs::new(self.index, dest);
        args.frequency_hz = self.settings.frequency_hz;
        args.sample_rate_hz = self.settings.sample_rate_hz;
        args.gain_db = self.settings.gain_db;
        args.bias_tee = self.settings.bias_tee;
        args
    }
}

#[async_trait]
impl Receiver for RtlSdrReceiver {
    async fn capture_for(&mut self, dest: &Path, duration: Duration) -> Result<CaptureStats> {
        if self.closed {
            return Err(Error::device("receiver already closed"));
        }

        let mut cmd = rtlsdr_cli::capture_command(&self.program, &self.capture_args(dest));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::device(format!("failed to spawn rtl_sdr: {}", e)))?;

        let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(drain_stderr(pipe)));

        let early_exit = match timeout(duration, child.wait()).await {
            Err(_) => {
                // Duration reached; rtl_sdr only stops when told to.
                let _ = child.kill().await;
                None
            }
            Ok(Ok(status)) => Some(status.to_string()),
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Some(format!("wait failed: {}", e))
            }
        };

        let last_line = match stderr_task {
            Some(task) => match timeout(STDERR_DRAIN_TIMEOUT, task).await {
                Ok(Ok(line)) => line,
                _ => None,
            },
            None => None,
        };
        if let Some(reason) = &early_exit {
            warn!(
                "rtl_sdr exited early ({}): {}",
                reason,
                last_line.as_deref().unwrap_or_default()
            );
        }

        let bytes_written = tokio::fs::metadata(dest).await.map(|m| m.len()).unwrap_or(0);
        Ok(CaptureStats {
            bytes_written,
            elapsed: started.elapsed(),
            completed: early_exit.is_none(),
        })
    }

    async fn close(&mut self) {
        if !self.closed {
            debug!(index = self.index, "Receiver closed");
        }
        self.closed = true;
    }
}
