//! One acquisition from dispatch to `Finished`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::busy::BusyGuard;
use super::clock::Clock;
use super::notify::RefreshSignal;
use super::service::SchedulerEvent;
use crate::{Error, Result};
use crate::acquisition::{AcquisitionEngine, AcquisitionReport};
use crate::archive::{ArchiveSummary, archive_directory};
use crate::database::repositories::RecordingRepository;
use crate::domain::{RecordingId, RecordingOutcome, RecordingRequest, RecordingStatus};

const FINALIZE_ATTEMPTS: u32 = 5;
const FINALIZE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How a dispatched recording ended.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub id: RecordingId,
    pub outcome: RecordingOutcome,
    pub points_planned: u64,
    pub points_captured: u32,
    pub detail: Option<String>,
    pub archive: Option<ArchiveSummary>,
    /// Whether the `Finished` status reached the store.
    pub persisted: bool,
}

/// Everything a worker needs, cloned out of the scheduler at dispatch.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub repo: Arc<dyn RecordingRepository>,
    pub engine: Arc<AcquisitionEngine>,
    pub clock: Arc<dyn Clock>,
    pub refresh: RefreshSignal,
    pub events: broadcast::Sender<SchedulerEvent>,
}

impl WorkerContext {
    /// Sweep, archive, finalize, then release the receiver.
    pub async fn run(self, request: RecordingRequest, guard: BusyGuard) -> WorkerReport {
        let id = request.id;
        let mut acquisition = match AssertUnwindSafe(self.engine.run(&request))
            .catch_unwind()
            .await
        {
            Ok(report) => report,
            Err(_) => {
                error!(recording_id = id, "Acquisition panicked");
                let mut report = AcquisitionReport::default();
                report.record_failure("acquisition panicked");
                report
            }
        };

        let layout = self.engine.layout();
        let archive = match archive_directory(layout.output_dir(id), layout.archive_path(id)).await
        {
            Ok(summary) => {
                if summary.missing_directory {
                    acquisition.record_failure("output directory missing at archive time");
                }
                if !summary.skipped.is_empty() {
                    acquisition.record_failure(format!(
                        "{} unreadable file(s) left out of the archive",
                        summary.skipped.len()
                    ));
                }
                Some(summary)
            }
            Err(e) => {
                error!(recording_id = id, "Archive failed: {}", e);
                acquisition.record_failure(format!("archive: {}", e));
                None
            }
        };

        let outcome = if acquisition.is_clean() {
            RecordingOutcome::Complete
        } else {
            RecordingOutcome::Degraded
        };
        let detail = acquisition.detail();

        let persisted = self
            .finalize_with_retry(id, outcome, detail.clone(), acquisition.points_captured)
            .await;

        drop(guard);
        let _ = self.events.send(SchedulerEvent::Finished { id, outcome });
        // A second request may already be due.
        self.refresh.notify();

        info!(
            recording_id = id,
            outcome = %outcome,
            captured = acquisition.points_captured,
            planned = acquisition.points_planned,
            "Recording finished"
        );

        WorkerReport {
            id,
            outcome,
            points_planned: acquisition.points_planned,
            points_captured: acquisition.points_captured,
            detail,
            archive,
            persisted,
        }
    }

    async fn finalize_with_retry(
        &self,
        id: RecordingId,
        outcome: RecordingOutcome,
        detail: Option<String>,
        captured_points: u32,
    ) -> bool {
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match finalize(
                self.repo.as_ref(),
                self.clock.as_ref(),
                id,
                outcome,
                detail.clone(),
                captured_points,
            )
            .await
            {
                Ok(_) => return true,
                Err(Error::NotFound { .. }) => {
                    warn!(recording_id = id, "Recording was deleted while running");
                    return false;
                }
                Err(e) if attempt < FINALIZE_ATTEMPTS => {
                    warn!(
                        recording_id = id,
                        "Failed to mark recording finished (attempt {}/{}): {}",
                        attempt,
                        FINALIZE_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(FINALIZE_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!(
                        recording_id = id,
                        "Giving up marking recording finished; it will be recovered at next start: {}",
                        e
                    );
                }
            }
        }
        false
    }
}

/// Mark `id` finished with `outcome`.
///
/// Returns `Ok(false)` without touching the store when the request is already
/// `Finished`, so calling it twice is harmless.
pub async fn finalize(
    repo: &dyn RecordingRepository,
    clock: &dyn Clock,
    id: RecordingId,
    outcome: RecordingOutcome,
    detail: Option<String>,
    captured_points: u32,
) -> Result<bool> {
    let mut request = repo.find_by_id(id).await?;
    if request.status.is_terminal() {
        debug!(recording_id = id, "Already finished, nothing to do");
        return Ok(false);
    }

    let now = clock.now_ms();
    if request.status == RecordingStatus::Created {
        request.transition_to(RecordingStatus::Running, now)?;
        repo.save(&request).await?;
    }
    request.finish(outcome, detail, captured_points, now)?;
    repo.save(&request).await?;
    Ok(true)
}
