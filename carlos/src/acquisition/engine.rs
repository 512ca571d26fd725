use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::disk::{DiskSpaceProbe, SystemDiskProbe, check_disk_space};
use crate::device::{DeviceBackend, Receiver, TunerSettings};
use crate::domain::{OutputLayout, RecordingRequest, SweepGrid};

/// Failure messages kept verbatim in a report; the rest are only counted.
const MAX_RECORDED_FAILURES: usize = 5;

/// Bytes per complex sample written by the receiver (8-bit I and Q).
const BYTES_PER_SAMPLE: u64 = 2;

/// Receiver and host settings shared by every recording.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionConfig {
    pub device_index: u32,
    /// `0` lets the tuner pick.
    pub bandwidth_hz: u32,
    pub bias_tee: bool,
    /// Free space to keep on the record disk. `0` disables the check.
    pub min_free_disk_bytes: u64,
}

/// What a sweep achieved. Failures are soft: they never stop the recording
/// from being archived and finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub points_planned: u64,
    pub points_captured: u32,
    failures: Vec<String>,
    failure_count: usize,
}

impl AcquisitionReport {
    pub fn record_failure(&mut self, message: impl Into<String>) {
        if self.failures.len() < MAX_RECORDED_FAILURES {
            self.failures.push(message.into());
        }
        self.failure_count += 1;
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    pub fn is_clean(&self) -> bool {
        self.failure_count == 0
    }

    /// Human-readable summary of the recorded failures, if any.
    pub fn detail(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let mut detail = self.failures.join("; ");
        let omitted = self.failure_count - self.failures.len();
        if omitted > 0 {
            detail.push_str(&format!("; and {} more", omitted));
        }
        Some(detail)
    }
}

/// Drives one receiver through a request's sweep.
pub struct AcquisitionEngine {
    backend: Arc<dyn DeviceBackend>,
    layout: OutputLayout,
    config: AcquisitionConfig,
    disk_probe: Arc<dyn DiskSpaceProbe>,
}

impl AcquisitionEngine {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        layout: OutputLayout,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            backend,
            layout,
            config,
            disk_probe: Arc::new(SystemDiskProbe),
        }
    }

    pub fn with_disk_probe(mut self, probe: Arc<dyn DiskSpaceProbe>) -> Self {
        self.disk_probe = probe;
        self
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    fn tuner_settings(&self, request: &RecordingRequest) -> TunerSettings {
        TunerSettings {
            sample_rate_hz: request.sample_rate_hz,
            frequency_hz: request.frequency_hz,
            bandwidth_hz: self.config.bandwidth_hz,
            gain_db: request.gain_db,
            bias_tee: self.config.bias_tee,
        }
    }

    fn required_bytes(request: &RecordingRequest, points: u64) -> u64 {
        let per_point = u64::from(request.sample_rate_hz)
            .saturating_mul(BYTES_PER_SAMPLE)
            .saturating_mul(request.capture_duration_ms)
            / 1000;
        per_point.saturating_mul(points)
    }

    /// Run the full sweep for `request`. Never fails: every problem is logged
    /// and recorded in the returned report.
    pub async fn run(&self, request: &RecordingRequest) -> AcquisitionReport {
        let id = request.id;
        let mut report = AcquisitionReport::default();

        let grid = match SweepGrid::new(&request.sweep) {
            Ok(grid) => grid,
            Err(e) => {
                error!(recording_id = id, "Refusing to sweep: {}", e);
                report.record_failure(format!("invalid sweep: {}", e));
                return report;
            }
        };
        report.points_planned = grid.len();

        let output_dir = self.layout.output_dir(id);
        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            error!(
                recording_id = id,
                "Failed to create output directory {}: {}",
                output_dir.display(),
                e
            );
            report.record_failure(format!("output directory: {}", e));
            return report;
        }

        if self.config.min_free_disk_bytes > 0 {
            let required = Self::required_bytes(request, grid.len())
                .saturating_add(self.config.min_free_disk_bytes);
            if check_disk_space(self.disk_probe.as_ref(), &output_dir, required).is_insufficient() {
                report.record_failure(format!(
                    "less than {} bytes free on the record disk",
                    required
                ));
            }
        }

        let mut receiver = match self.open_receiver(request, &mut report).await {
            Some(receiver) => receiver,
            None => return report,
        };

        info!(
            recording_id = id,
            points = grid.len(),
            capture_ms = request.capture_duration_ms,
            wait_ms = request.inter_position_wait_ms,
            "Starting sweep"
        );

        let capture = Duration::from_millis(request.capture_duration_ms);
        let wait = Duration::from_millis(request.inter_position_wait_ms);

        for (index, point) in grid.points().enumerate() {
            if index > 0 && !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            let path = self.layout.capture_path(id, &point);
            debug!(
                recording_id = id,
                azimuth = point.azimuth,
                elevation = point.elevation,
                "Capturing {}",
                path.display()
            );

            match receiver.capture_for(&path, capture).await {
                Ok(stats) if stats.completed => {
                    report.points_captured += 1;
                }
                Ok(stats) => {
                    warn!(
                        recording_id = id,
                        "Capture at az {:.1} el {:.1} ended early after {:?} ({} bytes)",
                        point.azimuth,
                        point.elevation,
                        stats.elapsed,
                        stats.bytes_written
                    );
                    report.record_failure(format!(
                        "capture at az {:.1} el {:.1} ended early",
                        point.azimuth, point.elevation
                    ));
                }
                Err(e) => {
                    warn!(
                        recording_id = id,
                        "Capture at az {:.1} el {:.1} failed: {}",
                        point.azimuth,
                        point.elevation,
                        e
                    );
                    report.record_failure(format!(
                        "capture at az {:.1} el {:.1}: {}",
                        point.azimuth, point.elevation, e
                    ));
                }
            }
        }

        receiver.close().await;

        info!(
            recording_id = id,
            captured = report.points_captured,
            planned = report.points_planned,
            failures = report.failure_count(),
            "Sweep finished"
        );
        report
    }

    async fn open_receiver(
        &self,
        request: &RecordingRequest,
        report: &mut AcquisitionReport,
    ) -> Option<Box<dyn Receiver>> {
        let id = request.id;

        match self.backend.list_devices().await {
            Ok(devices) if devices.is_empty() => {
                warn!(recording_id = id, "No receiver attached, skipping captures");
                report.record_failure("no receiver attached");
                return None;
            }
            Ok(devices) => {
                debug!(recording_id = id, "{} receiver(s) attached", devices.len());
            }
            Err(e) => {
                warn!(recording_id = id, "Failed to list receivers: {}", e);
                report.record_failure(format!("listing receivers: {}", e));
                return None;
            }
        }

        match self
            .backend
            .configure(self.config.device_index, &self.tuner_settings(request))
            .await
        {
            Ok(receiver) => Some(receiver),
            Err(e) => {
                warn!(recording_id = id, "Failed to configure receiver: {}", e);
                report.record_failure(format!("configuring receiver: {}", e));
                None
            }
        }
    }
}
