//! Recording requests: the unit of work the scheduler drives.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use super::sweep::{SweepDescriptor, SweepGrid, SweepPoint};
use crate::{Error, Result};

/// Identifier of a recording. Derived from the creation instant in Unix ms.
pub type RecordingId = i64;

/// Lifecycle status. Only ever moves forward, one step at a time.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum RecordingStatus {
    Created,
    Running,
    Finished,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Finished => "Finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Created" => Some(Self::Created),
            "Running" => Some(Self::Running),
            "Finished" => Some(Self::Finished),
            _ => None,
        }
    }

    /// The single status this one may advance to.
    pub fn successor(&self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Running),
            Self::Running => Some(Self::Finished),
            Self::Finished => None,
        }
    }

    /// Whether `next` is reachable in one step. Staying put is allowed.
    pub fn can_transition_to(&self, next: Self) -> bool {
        *self == next || self.successor() == Some(next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// How a finished recording went. Only set once the request is `Finished`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum RecordingOutcome {
    /// Every sweep position captured and the archive written.
    Complete,
    /// Finished with at least one soft failure; see the outcome detail.
    Degraded,
    /// Found `Running` at startup: the process died mid-acquisition.
    Interrupted,
}

impl RecordingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "Complete",
            Self::Degraded => "Degraded",
            Self::Interrupted => "Interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Complete" => Some(Self::Complete),
            "Degraded" => Some(Self::Degraded),
            "Interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

/// A scheduled acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingRequest {
    pub id: RecordingId,
    pub user: String,
    /// Instant (Unix ms) at which the request becomes eligible to run.
    #[serde(rename = "time")]
    pub scheduled_time_ms: i64,
    #[serde(rename = "frequency")]
    pub frequency_hz: u32,
    #[serde(rename = "sample_rate")]
    pub sample_rate_hz: u32,
    #[serde(rename = "gain")]
    pub gain_db: f64,
    /// Capture length at each sweep position.
    #[serde(rename = "rec_time")]
    pub capture_duration_ms: u64,
    /// Pause between consecutive positions.
    #[serde(rename = "wait_time")]
    pub inter_position_wait_ms: u64,
    #[serde(flatten)]
    pub sweep: SweepDescriptor,
    #[serde(rename = "calc_time")]
    pub estimated_duration_ms: u64,
    pub status: RecordingStatus,
    pub outcome: Option<RecordingOutcome>,
    pub outcome_detail: Option<String>,
    pub captured_points: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RecordingRequest {
    /// Whether the scheduled instant has been reached.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.scheduled_time_ms <= now_ms
    }

    /// Advance the status, refusing regressions and skipped steps.
    pub fn transition_to(&mut self, next: RecordingStatus, now_ms: i64) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now_ms;
        Ok(())
    }

    /// Move to `Finished` and record how it went.
    pub fn finish(
        &mut self,
        outcome: RecordingOutcome,
        detail: Option<String>,
        captured_points: u32,
        now_ms: i64,
    ) -> Result<()> {
        self.transition_to(RecordingStatus::Finished, now_ms)?;
        self.outcome = Some(outcome);
        self.outcome_detail = detail;
        self.captured_points = captured_points;
        Ok(())
    }
}

/// Expected wall time of a sweep: every position costs one capture plus one wait.
pub fn estimate_duration_ms(sweep: &SweepDescriptor, capture_ms: u64, wait_ms: u64) -> u64 {
    match SweepGrid::new(sweep) {
        Ok(grid) => grid
            .len()
            .saturating_mul(capture_ms.saturating_add(wait_ms)),
        Err(_) => 0,
    }
}

/// Intake payload for a new recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecording {
    #[serde(default)]
    pub user: String,
    /// Scheduled instant, Unix ms.
    pub time: i64,
    pub frequency: u32,
    pub sample_rate: u32,
    #[serde(default)]
    pub gain: f64,
    /// Capture duration per position, ms.
    pub rec_time: i64,
    /// Wait between positions, ms.
    #[serde(default)]
    pub wait_time: i64,
    pub az: f64,
    pub el: f64,
    #[serde(default)]
    pub az_range: f64,
    #[serde(default = "default_step")]
    pub az_step: f64,
    #[serde(default)]
    pub el_range: f64,
    #[serde(default = "default_step")]
    pub el_step: f64,
}

fn default_step() -> f64 {
    1.0
}

impl NewRecording {
    fn sweep(&self) -> SweepDescriptor {
        SweepDescriptor {
            az: self.az,
            el: self.el,
            az_range: self.az_range,
            az_step: self.az_step,
            el_range: self.el_range,
            el_step: self.el_step,
        }
    }

    /// Admission checks. A request that fails here never reaches `Created`.
    pub fn validate(&self, now_ms: i64) -> Result<()> {
        if self.time <= now_ms {
            return Err(Error::validation("Time is in the past"));
        }
        if self.rec_time < 1 {
            return Err(Error::validation("Record time too short"));
        }
        if self.wait_time < 0 {
            return Err(Error::validation("Wait time can't be negative"));
        }
        if self.sample_rate == 0 {
            return Err(Error::validation("Sample rate must be positive"));
        }
        if self.frequency == 0 {
            return Err(Error::validation("Frequency must be positive"));
        }
        if !self.gain.is_finite() {
            return Err(Error::validation("Gain must be a finite number"));
        }
        SweepGrid::new(&self.sweep()).map_err(|e| Error::validation(e.to_string()))?;
        Ok(())
    }

    /// Build the stored request. Call [`NewRecording::validate`] first.
    pub fn into_request(self, id: RecordingId, now_ms: i64) -> RecordingRequest {
        let sweep = self.sweep();
        let capture_duration_ms = self.rec_time.max(1) as u64;
        let inter_position_wait_ms = self.wait_time.max(0) as u64;
        RecordingRequest {
            id,
            user: self.user,
            scheduled_time_ms: self.time,
            frequency_hz: self.frequency,
            sample_rate_hz: self.sample_rate,
            gain_db: self.gain,
            capture_duration_ms,
            inter_position_wait_ms,
            sweep,
            estimated_duration_ms: estimate_duration_ms(
                &sweep,
                capture_duration_ms,
                inter_position_wait_ms,
            ),
            status: RecordingStatus::Created,
            outcome: None,
            outcome_detail: None,
            captured_points: 0,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}

/// Hands out strictly increasing ids derived from the creation instant.
#[derive(Debug, Default)]
pub struct RecordingIdGenerator {
    last: AtomicI64,
}

impl RecordingIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with the highest id already stored so restarts never reuse one.
    pub fn starting_after(last: RecordingId) -> Self {
        Self {
            last: AtomicI64::new(last),
        }
    }

    pub fn next_id(&self, now_ms: i64) -> RecordingId {
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now_ms.max(current.saturating_add(1));
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Where a recording's files live under the record path.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    base: PathBuf,
}

impl OutputLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `<base>/<id>/`
    pub fn output_dir(&self, id: RecordingId) -> PathBuf {
        self.base.join(id.to_string())
    }

    /// `<base>/<id>.tar.gz`
    pub fn archive_path(&self, id: RecordingId) -> PathBuf {
        self.base.join(format!("{}.tar.gz", id))
    }

    /// `<id>-<az>-<el>.iq`, positions with one decimal.
    pub fn capture_file_name(id: RecordingId, point: &SweepPoint) -> String {
        format!("{}-{:.1}-{:.1}.iq", id, point.azimuth, point.elevation)
    }

    pub fn capture_path(&self, id: RecordingId, point: &SweepPoint) -> PathBuf {
        self.output_dir(id)
            .join(Self::capture_file_name(id, point))
    }
}
