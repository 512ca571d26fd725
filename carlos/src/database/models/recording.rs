//! Recording database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{RecordingOutcome, RecordingRequest, RecordingStatus, SweepDescriptor};
use crate::{Error, Result};

/// One row of the `recordings` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RecordingDbModel {
    pub id: i64,
    pub user_name: String,
    /// Unix epoch milliseconds (UTC) at which the request becomes due.
    pub scheduled_time: i64,
    pub frequency: i64,
    pub sample_rate: i64,
    pub gain: f64,
    /// Capture duration per position, ms.
    pub rec_time: i64,
    /// Wait between positions, ms.
    pub wait_time: i64,
    pub az: f64,
    pub el: f64,
    pub az_range: f64,
    pub az_step: f64,
    pub el_range: f64,
    pub el_step: f64,
    pub estimated_duration_ms: i64,
    /// Created, Running or Finished.
    pub status: String,
    pub outcome: Option<String>,
    pub outcome_detail: Option<String>,
    pub captured_points: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

fn column<T: TryFrom<i64>>(name: &str, value: i64) -> Result<T> {
    T::try_from(value).map_err(|_| Error::Database(format!("column {name} out of range: {value}")))
}

impl TryFrom<RecordingDbModel> for RecordingRequest {
    type Error = Error;

    fn try_from(model: RecordingDbModel) -> Result<Self> {
        let status = RecordingStatus::parse(&model.status)
            .ok_or_else(|| Error::Database(format!("unknown status '{}'", model.status)))?;
        let outcome = match model.outcome.as_deref() {
            Some(raw) => Some(
                RecordingOutcome::parse(raw)
                    .ok_or_else(|| Error::Database(format!("unknown outcome '{raw}'")))?,
            ),
            None => None,
        };

        Ok(Self {
            id: model.id,
            user: model.user_name,
            scheduled_time_ms: model.scheduled_time,
            frequency_hz: column("frequency", model.frequency)?,
            sample_rate_hz: column("sample_rate", model.sample_rate)?,
            gain_db: model.gain,
            capture_duration_ms: column("rec_time", model.rec_time)?,
            inter_position_wait_ms: column("wait_time", model.wait_time)?,
            sweep: SweepDescriptor {
                az: model.az,
                el: model.el,
                az_range: model.az_range,
                az_step: model.az_step,
                el_range: model.el_range,
                el_step: model.el_step,
            },
            estimated_duration_ms: column("estimated_duration_ms", model.estimated_duration_ms)?,
            status,
            outcome,
            outcome_detail: model.outcome_detail,
            captured_points: column("captured_points", model.captured_points)?,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}

impl From<&RecordingRequest> for RecordingDbModel {
    fn from(request: &RecordingRequest) -> Self {
        Self {
            id: request.id,
            user_name: request.user.clone(),
            scheduled_time: request.scheduled_time_ms,
            frequency: i64::from(request.frequency_hz),
            sample_rate: i64::from(request.sample_rate_hz),
            gain: request.gain_db,
            rec_time: i64::try_from(request.capture_duration_ms).unwrap_or(i64::MAX),
            wait_time: i64::try_from(request.inter_position_wait_ms).unwrap_or(i64::MAX),
            az: request.sweep.az,
            el: request.sweep.el,
            az_range: request.sweep.az_range,
            az_step: request.sweep.az_step,
            el_range: request.sweep.el_range,
            el_step: request.sweep.el_step,
            estimated_duration_ms: i64::try_from(request.estimated_duration_ms)
                .unwrap_or(i64::MAX),
            status: request.status.as_str().to_string(),
            outcome: request.outcome.map(|o| o.as_str().to_string()),
            outcome_detail: request.outcome_detail.clone(),
            captured_points: i64::from(request.captured_points),
            created_at: request.created_at,
            updated_at: request.updated_at,
        }
    }
}
