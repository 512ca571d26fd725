//! The scheduler loop.
//!
//! Polls the store for due `Created` requests and hands at most one of them
//! at a time to a worker task. The [`BusyFlag`] is what enforces that: a tick
//! that finds the flag set simply does nothing and the request is picked up
//! by a later tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::busy::BusyFlag;
use super::clock::{Clock, SystemClock};
use super::notify::RefreshSignal;
use super::worker::{WorkerContext, WorkerReport, finalize};
use crate::{Error, Result};
use crate::acquisition::AcquisitionEngine;
use crate::archive::archive_directory;
use crate::database::repositories::RecordingRepository;
use crate::domain::{RecordingId, RecordingOutcome, RecordingRequest, RecordingStatus};

/// Default poll interval (1 second).
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

const INTERRUPTED_DETAIL: &str = "process stopped during acquisition";

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Lifecycle notifications published by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Dispatched { id: RecordingId },
    Finished {
        id: RecordingId,
        outcome: RecordingOutcome,
    },
    /// Found `Running` at startup and closed as interrupted.
    Recovered { id: RecordingId },
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Dispatched(RecordingId),
    /// The receiver is in use.
    Busy,
    /// Nothing due.
    Idle,
    /// The store could not be read or written; retried next tick.
    StoreError,
}

pub struct Scheduler {
    repo: Arc<dyn RecordingRepository>,
    engine: Arc<AcquisitionEngine>,
    busy: BusyFlag,
    refresh: RefreshSignal,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    events: broadcast::Sender<SchedulerEvent>,
    /// `Created` requests as of the last reload.
    candidates: Vec<RecordingRequest>,
    stale: bool,
    worker: Option<(RecordingId, JoinHandle<WorkerReport>)>,
    /// A worker's `Finished` status that never reached the store. Its row is
    /// still `Running`, so nothing else is dispatched until it is written.
    unpersisted: Option<WorkerReport>,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn RecordingRepository>,
        engine: Arc<AcquisitionEngine>,
        busy: BusyFlag,
        refresh: RefreshSignal,
        config: SchedulerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            repo,
            engine,
            busy,
            refresh,
            clock: Arc::new(SystemClock),
            config,
            events,
            candidates: Vec::new(),
            stale: true,
            worker: None,
            unpersisted: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// One loop iteration: refresh candidates if needed and dispatch at most
    /// one due request.
    pub async fn tick(&mut self) -> TickOutcome {
        let worker_done = self
            .worker
            .as_ref()
            .is_some_and(|(_, handle)| handle.is_finished());
        if worker_done && let Some(report) = self.join_worker().await {
            debug!(recording_id = report.id, "Reaped finished worker");
        }

        if self.refresh.take() {
            self.stale = true;
        }

        if self.stale {
            match self.repo.find_by_status(RecordingStatus::Created).await {
                Ok(candidates) => {
                    trace!("Loaded {} pending recording(s)", candidates.len());
                    self.candidates = candidates;
                    self.stale = false;
                }
                Err(e) => {
                    warn!("Failed to load pending recordings, retrying next tick: {}", e);
                    return TickOutcome::StoreError;
                }
            }
        }

        if self.busy.is_busy() {
            return TickOutcome::Busy;
        }

        // A worker that already released the flag is about to return.
        if self.worker.is_some() {
            self.join_worker().await;
        }

        if !self.settle_unpersisted().await {
            return TickOutcome::StoreError;
        }

        let now = self.clock.now_ms();
        match self.candidates.iter().position(|r| r.is_due(now)) {
            Some(index) => self.dispatch(index, now).await,
            None => TickOutcome::Idle,
        }
    }

    async fn dispatch(&mut self, index: usize, now: i64) -> TickOutcome {
        // The flag is taken before anything is persisted; every early return
        // below drops the guard and clears it again.
        let Some(guard) = self.busy.try_acquire() else {
            return TickOutcome::Busy;
        };

        let mut request = self.candidates.remove(index);
        self.stale = true;
        let id = request.id;

        if let Err(e) = request.transition_to(RecordingStatus::Running, now) {
            warn!(recording_id = id, "Skipping recording: {}", e);
            return TickOutcome::Idle;
        }
        if let Err(e) = self.repo.save(&request).await {
            error!(recording_id = id, "Failed to mark recording running: {}", e);
            return TickOutcome::StoreError;
        }

        info!(
            recording_id = id,
            user = %request.user,
            scheduled_time = request.scheduled_time_ms,
            estimated_ms = request.estimated_duration_ms,
            "Dispatching recording"
        );

        let context = WorkerContext {
            repo: self.repo.clone(),
            engine: self.engine.clone(),
            clock: self.clock.clone(),
            refresh: self.refresh.clone(),
            events: self.events.clone(),
        };
        let handle = tokio::spawn(context.run(request, guard));
        self.worker = Some((id, handle));
        let _ = self.events.send(SchedulerEvent::Dispatched { id });

        TickOutcome::Dispatched(id)
    }

    /// Wait for the in-flight worker, if any, and return its report.
    pub async fn join_worker(&mut self) -> Option<WorkerReport> {
        let (id, handle) = self.worker.take()?;
        let report = self.settle(id, handle.await).await;
        if !report.persisted {
            self.unpersisted = Some(report.clone());
        }
        Some(report)
    }

    /// Write a finish the worker could not persist. Returns `false` while the
    /// store still refuses it.
    async fn settle_unpersisted(&mut self) -> bool {
        let Some(report) = self.unpersisted.as_ref() else {
            return true;
        };
        let id = report.id;

        match finalize(
            self.repo.as_ref(),
            self.clock.as_ref(),
            id,
            report.outcome,
            report.detail.clone(),
            report.points_captured,
        )
        .await
        {
            Ok(_) => {
                info!(recording_id = id, "Recorded pending finish");
            }
            Err(Error::NotFound { .. }) => {
                debug!(recording_id = id, "Pending finish dropped, recording was deleted");
            }
            Err(e) => {
                warn!(
                    recording_id = id,
                    "Recording still not marked finished, holding dispatch: {}", e
                );
                return false;
            }
        }

        self.unpersisted = None;
        self.stale = true;
        true
    }

    async fn settle(
        &self,
        id: RecordingId,
        joined: std::result::Result<WorkerReport, JoinError>,
    ) -> WorkerReport {
        match joined {
            Ok(report) => report,
            Err(e) => {
                // The guard was dropped during unwinding; only the status is left.
                error!(recording_id = id, "Worker task failed: {}", e);
                let outcome = RecordingOutcome::Degraded;
                let detail = Some(format!("worker failed: {}", e));
                let persisted = match finalize(
                    self.repo.as_ref(),
                    self.clock.as_ref(),
                    id,
                    outcome,
                    detail.clone(),
                    0,
                )
                .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        error!(recording_id = id, "Failed to mark recording finished: {}", e);
                        false
                    }
                };
                let _ = self.events.send(SchedulerEvent::Finished { id, outcome });
                self.refresh.notify();

                WorkerReport {
                    id,
                    outcome,
                    points_planned: 0,
                    points_captured: 0,
                    detail,
                    archive: None,
                    persisted,
                }
            }
        }
    }

    /// Close out requests left `Running` by a previous process. Whatever they
    /// captured is archived and they finish as `Interrupted`.
    pub async fn recover_interrupted(&mut self) -> Result<usize> {
        let running = self.repo.find_by_status(RecordingStatus::Running).await?;
        let mut recovered = 0;

        for mut request in running {
            let id = request.id;
            let layout = self.engine.layout();
            let captured = match archive_directory(layout.output_dir(id), layout.archive_path(id))
                .await
            {
                Ok(summary) => u32::try_from(summary.files.len()).unwrap_or(u32::MAX),
                Err(e) => {
                    warn!(recording_id = id, "Failed to archive interrupted recording: {}", e);
                    0
                }
            };

            let now = self.clock.now_ms();
            if let Err(e) = request.finish(
                RecordingOutcome::Interrupted,
                Some(INTERRUPTED_DETAIL.to_string()),
                captured,
                now,
            ) {
                warn!(recording_id = id, "Cannot recover recording: {}", e);
                continue;
            }
            if let Err(e) = self.repo.save(&request).await {
                warn!(recording_id = id, "Failed to save recovered recording: {}", e);
                continue;
            }

            warn!(recording_id = id, "Recording was interrupted by a restart");
            let _ = self.events.send(SchedulerEvent::Recovered { id });
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Run until `cancellation` fires. An in-flight recording is allowed to
    /// finish before this returns.
    pub async fn run(mut self, cancellation: CancellationToken) {
        info!(
            "Scheduler started (poll interval {:?})",
            self.config.poll_interval
        );

        match self.recover_interrupted().await {
            Ok(0) => {}
            Ok(n) => info!("Recovered {} interrupted recording(s)", n),
            Err(e) => warn!("Failed to recover interrupted recordings: {}", e),
        }

        let refresh = self.refresh.clone();
        loop {
            if cancellation.is_cancelled() {
                break;
            }

            let outcome = self.tick().await;
            trace!(?outcome, "Scheduler tick");

            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = refresh.notified() => {}
            }
        }

        if self.worker.is_some() {
            info!("Waiting for the in-flight recording to finish");
            self.join_worker().await;
        }
        if !self.settle_unpersisted().await {
            warn!("Leaving an unfinished recording for recovery at next start");
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionConfig;
    use crate::device::{CaptureStats, DeviceBackend, DeviceDescriptor, Receiver, TunerSettings};
    use crate::domain::{NewRecording, OutputLayout};
    use crate::scheduler::clock::ManualClock;
    use crate::Error;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    const NOW: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct MockRepository {
        rows: Mutex<BTreeMap<RecordingId, RecordingRequest>>,
        fail_reads: AtomicBool,
        fail_saves: AtomicBool,
        saves: AtomicUsize,
    }

    impl MockRepository {
        fn insert(&self, request: RecordingRequest) {
            self.rows.lock().unwrap().insert(request.id, request);
        }

        fn get(&self, id: RecordingId) -> RecordingRequest {
            self.rows.lock().unwrap()[&id].clone()
        }

        fn count(&self, status: RecordingStatus) -> usize {
            self.rows
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.status == status)
                .count()
        }
    }

    #[async_trait]
    impl RecordingRepository for MockRepository {
        async fn find_by_status(&self, status: RecordingStatus) -> Result<Vec<RecordingRequest>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Error::Database("store offline".into()));
            }
            let mut rows: Vec<_> = self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.status == status)
                .cloned()
                .collect();
            rows.sort_by_key(|r| (r.scheduled_time_ms, r.id));
            Ok(rows)
        }

        async fn find_by_id(&self, id: RecordingId) -> Result<RecordingRequest> {
            self.rows
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::not_found("Recording", id.to_string()))
        }

        async fn save(&self, request: &RecordingRequest) -> Result<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(Error::Database("store offline".into()));
            }
            let mut rows = self.rows.lock().unwrap();
            let Some(current) = rows.get(&request.id) else {
                return Err(Error::not_found("Recording", request.id.to_string()));
            };
            if !current.status.can_transition_to(request.status) {
                return Err(Error::InvalidStateTransition {
                    from: current.status.to_string(),
                    to: request.status.to_string(),
                });
            }
            rows.insert(request.id, request.clone());
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn create(&self, request: &RecordingRequest) -> Result<()> {
            self.insert(request.clone());
            Ok(())
        }

        async fn list_all(&self) -> Result<Vec<RecordingRequest>> {
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }

        async fn delete_all(&self) -> Result<u64> {
            let mut rows = self.rows.lock().unwrap();
            let n = rows.len() as u64;
            rows.clear();
            Ok(n)
        }

        async fn max_id(&self) -> Result<Option<RecordingId>> {
            Ok(self.rows.lock().unwrap().keys().next_back().copied())
        }
    }

    /// Each capture waits for a permit on `gate`.
    struct GatedBackend {
        gate: Arc<Semaphore>,
        devices: u32,
        panic_on_capture: bool,
    }

    impl GatedBackend {
        fn open() -> Self {
            Self {
                gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
                devices: 1,
                panic_on_capture: false,
            }
        }

        fn closed() -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            (
                Self {
                    gate: gate.clone(),
                    devices: 1,
                    panic_on_capture: false,
                },
                gate,
            )
        }
    }

    struct GatedReceiver {
        gate: Arc<Semaphore>,
        panic_on_capture: bool,
    }

    #[async_trait]
    impl DeviceBackend for GatedBackend {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
            Ok((0..self.devices)
                .map(|index| DeviceDescriptor {
                    index,
                    name: "gated".into(),
                    serial: None,
                })
                .collect())
        }

        async fn configure(&self, _index: u32, _settings: &TunerSettings) -> Result<Box<dyn Receiver>> {
            Ok(Box::new(GatedReceiver {
                gate: self.gate.clone(),
                panic_on_capture: self.panic_on_capture,
            }))
        }
    }

    #[async_trait]
    impl Receiver for GatedReceiver {
        async fn capture_for(&mut self, dest: &Path, duration: Duration) -> Result<CaptureStats> {
            if self.panic_on_capture {
                panic!("receiver fell over");
            }
            self.gate
                .acquire()
                .await
                .map_err(|e| Error::device(e.to_string()))?
                .forget();
            std::fs::write(dest, b"iq-samples")?;
            Ok(CaptureStats {
                bytes_written: 10,
                elapsed: duration,
                completed: true,
            })
        }

        async fn close(&mut self) {}
    }

    struct Harness {
        scheduler: Scheduler,
        repo: Arc<MockRepository>,
        clock: Arc<ManualClock>,
        busy: BusyFlag,
        refresh: RefreshSignal,
        dir: tempfile::TempDir,
    }

    fn harness(backend: GatedBackend) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(MockRepository::default());
        let clock = Arc::new(ManualClock::new(NOW));
        let busy = BusyFlag::new();
        let refresh = RefreshSignal::new();
        let engine = Arc::new(AcquisitionEngine::new(
            Arc::new(backend),
            OutputLayout::new(dir.path()),
            AcquisitionConfig::default(),
        ));
        let scheduler = Scheduler::new(
            repo.clone(),
            engine,
            busy.clone(),
            refresh.clone(),
            SchedulerConfig {
                poll_interval: Duration::from_millis(10),
            },
        )
        .with_clock(clock.clone());

        Harness {
            scheduler,
            repo,
            clock,
            busy,
            refresh,
            dir,
        }
    }

    fn request(id: RecordingId, time: i64) -> RecordingRequest {
        NewRecording {
            user: "observer".into(),
            time,
            frequency: 1_420_405_752,
            sample_rate: 2_048_000,
            gain: 0.0,
            rec_time: 100,
            wait_time: 0,
            az: 180.0,
            el: 45.0,
            az_range: 0.0,
            az_step: 1.0,
            el_range: 0.0,
            el_step: 1.0,
        }
        .into_request(id, NOW - 10_000)
    }

    #[tokio::test]
    async fn test_single_point_recording_runs_to_finished() {
        let mut h = harness(GatedBackend::open());
        let mut events = h.scheduler.subscribe();
        h.repo.insert(request(1, NOW - 1000));

        assert_eq!(h.scheduler.tick().await, TickOutcome::Dispatched(1));
        assert!(h.busy.is_busy());
        assert_eq!(h.repo.get(1).status, RecordingStatus::Running);

        let report = h.scheduler.join_worker().await.unwrap();
        assert_eq!(report.outcome, RecordingOutcome::Complete);
        assert_eq!(report.points_captured, 1);
        assert!(report.persisted);

        let stored = h.repo.get(1);
        assert_eq!(stored.status, RecordingStatus::Finished);
        assert_eq!(stored.outcome, Some(RecordingOutcome::Complete));
        assert_eq!(stored.captured_points, 1);
        assert!(!h.busy.is_busy());

        let files = crate::archive::list_output_files(&h.dir.path().join("1")).unwrap();
        assert_eq!(files, vec!["1-180.0-45.0.iq"]);
        assert!(h.dir.path().join("1.tar.gz").is_file());

        assert_eq!(events.recv().await.unwrap(), SchedulerEvent::Dispatched { id: 1 });
        assert_eq!(
            events.recv().await.unwrap(),
            SchedulerEvent::Finished {
                id: 1,
                outcome: RecordingOutcome::Complete
            }
        );
    }

    #[tokio::test]
    async fn test_two_due_requests_run_one_at_a_time() {
        let (backend, gate) = GatedBackend::closed();
        let mut h = harness(backend);
        h.repo.insert(request(1, NOW - 2000));
        h.repo.insert(request(2, NOW - 2000));

        let first = match h.scheduler.tick().await {
            TickOutcome::Dispatched(id) => id,
            other => panic!("expected a dispatch, got {:?}", other),
        };
        let second = if first == 1 { 2 } else { 1 };

        // Let the worker reach the gate, then poll again while it holds the receiver.
        tokio::task::yield_now().await;
        h.refresh.notify();
        assert_eq!(h.scheduler.tick().await, TickOutcome::Busy);
        assert_eq!(h.scheduler.tick().await, TickOutcome::Busy);
        assert_eq!(h.repo.count(RecordingStatus::Running), 1);
        assert_eq!(h.repo.get(second).status, RecordingStatus::Created);

        gate.add_permits(1);
        let report = h.scheduler.join_worker().await.unwrap();
        assert_eq!(report.id, first);
        assert_eq!(h.repo.get(first).status, RecordingStatus::Finished);
        assert!(!h.busy.is_busy());

        assert_eq!(h.scheduler.tick().await, TickOutcome::Dispatched(second));
        assert_eq!(h.repo.count(RecordingStatus::Running), 1);
        gate.add_permits(1);
        h.scheduler.join_worker().await.unwrap();
        assert_eq!(h.repo.count(RecordingStatus::Finished), 2);
    }

    #[tokio::test]
    async fn test_future_request_waits_for_its_time() {
        let mut h = harness(GatedBackend::open());
        h.repo.insert(request(1, NOW + 5000));

        assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
        h.clock.advance(4999);
        assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);
        assert_eq!(h.repo.get(1).status, RecordingStatus::Created);

        h.clock.advance(1);
        assert_eq!(h.scheduler.tick().await, TickOutcome::Dispatched(1));
        h.scheduler.join_worker().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_request_seen_after_refresh() {
        let mut h = harness(GatedBackend::open());
        assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);

        h.repo.insert(request(5, NOW - 1));
        assert_eq!(h.scheduler.tick().await, TickOutcome::Idle);

        h.refresh.notify();
        assert_eq!(h.scheduler.tick().await, TickOutcome::Dispatched(5));
        h.scheduler.join_worker().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_device_still_finishes() {
        let mut backend = GatedBackend::open();
        backend.devices = 0;
        let mut h = harness(backend);
        h.repo.insert(request(1, NOW - 1000));

        assert_eq!(h.scheduler.tick().await, TickOutcome::Dispatched(1));
        let report = h.scheduler.join_worker().await.unwrap();

        assert_eq!(report.outcome, RecordingOutcome::Degraded);
        assert_eq!(report.points_captured, 0);
        let stored = h.repo.get(1);
        assert_eq!(stored.status, RecordingStatus::Finished);
        assert_eq!(stored.outcome_detail.as_deref(), Some("no receiver attached"));
        assert!(h.dir.path().join("1.tar.gz").is_file());
        assert!(!h.busy.is_busy());
    }

    #[tokio::test]
    async fn test_panicking_receiver_still_finishes() {
        let mut backend = GatedBackend::open();
        backend.panic_on_capture = true;
        let mut h = harness(backend);
        h.repo.insert(request(1, NOW - 1000));

        h.scheduler.tick().await;
        let report = h.scheduler.join_worker().await.unwrap();

        assert_eq!(report.outcome, RecordingOutcome::Degraded);
        assert!(report.detail.unwrap().contains("panicked"));
        assert_eq!(h.repo.get(1).status, RecordingStatus::Finished);
        assert!(!h.busy.is_busy());
    }

    #[tokio::test]
    async fn test_store_read_error_is_retried() {
        let mut h = harness(GatedBackend::open());
        h.repo.insert(request(1, NOW - 1000));
        h.repo.fail_reads.store(true, Ordering::SeqCst);

        assert_eq!(h.scheduler.tick().await, TickOutcome::StoreError);
        assert_eq!(h.scheduler.tick().await, TickOutcome::StoreError);

        h.repo.fail_reads.store(false, Ordering::SeqCst);
        assert_eq!(h.scheduler.tick().await, TickOutcome::Dispatched(1));
        h.scheduler.join_worker().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_dispatch_releases_flag() {
        let mut h = harness(GatedBackend::open());
        h.repo.insert(request(1, NOW - 1000));
        h.repo.fail_saves.store(true, Ordering::SeqCst);

        assert_eq!(h.scheduler.tick().await, TickOutcome::StoreError);
        assert!(!h.busy.is_busy());
        assert!(h.scheduler.join_worker().await.is_none());
        assert_eq!(h.repo.get(1).status, RecordingStatus::Created);

        h.repo.fail_saves.store(false, Ordering::SeqCst);
        assert_eq!(h.scheduler.tick().await, TickOutcome::Dispatched(1));
        h.scheduler.join_worker().await.unwrap();
        assert_eq!(h.repo.get(1).status, RecordingStatus::Finished);
    }

    #[tokio::test]
    async fn test_unpersisted_finish_blocks_next_dispatch() {
        let (backend, gate) = GatedBackend::closed();
        let mut h = harness(backend);
        h.repo.insert(request(1, NOW - 2000));

        assert_eq!(h.scheduler.tick().await, TickOutcome::Dispatched(1));
        tokio::task::yield_now().await;

        // The store goes away after the request is marked running.
        h.repo.fail_saves.store(true, Ordering::SeqCst);
        gate.add_permits(2);
        let report = h.scheduler.join_worker().await.unwrap();
        assert!(!report.persisted);
        assert!(!h.busy.is_busy());
        assert_eq!(h.repo.get(1).status, RecordingStatus::Running);

        h.repo.insert(request(2, NOW - 1000));
        h.refresh.notify();
        assert_eq!(h.scheduler.tick().await, TickOutcome::StoreError);
        assert_eq!(h.repo.get(2).status, RecordingStatus::Created);
        assert_eq!(h.repo.count(RecordingStatus::Running), 1);

        h.repo.fail_saves.store(false, Ordering::SeqCst);
        assert_eq!(h.scheduler.tick().await, TickOutcome::Dispatched(2));
        let first = h.repo.get(1);
        assert_eq!(first.status, RecordingStatus::Finished);
        assert_eq!(first.outcome, Some(RecordingOutcome::Complete));
        assert_eq!(first.captured_points, 1);
        assert_eq!(h.repo.count(RecordingStatus::Running), 1);

        h.scheduler.join_worker().await.unwrap();
        assert_eq!(h.repo.count(RecordingStatus::Finished), 2);
    }

    #[tokio::test]
    async fn test_pending_finish_dropped_when_cleared() {
        let (backend, gate) = GatedBackend::closed();
        let mut h = harness(backend);
        h.repo.insert(request(1, NOW - 2000));

        h.scheduler.tick().await;
        tokio::task::yield_now().await;
        h.repo.fail_saves.store(true, Ordering::SeqCst);
        gate.add_permits(2);
        assert!(!h.scheduler.join_worker().await.unwrap().persisted);

        h.repo.fail_saves.store(false, Ordering::SeqCst);
        h.repo.delete_all().await.unwrap();
        h.repo.insert(request(2, NOW - 1000));
        h.refresh.notify();
        assert_eq!(h.scheduler.tick().await, TickOutcome::Dispatched(2));
        gate.add_permits(1);
        h.scheduler.join_worker().await.unwrap();
        assert_eq!(h.repo.get(2).status, RecordingStatus::Finished);
    }

    #[tokio::test]
    async fn test_finalize_twice_is_harmless() {
        let mut h = harness(GatedBackend::open());
        h.repo.insert(request(1, NOW - 1000));
        h.scheduler.tick().await;
        h.scheduler.join_worker().await.unwrap();

        let before = h.repo.get(1);
        let saves = h.repo.saves.load(Ordering::SeqCst);
        let archive = h.dir.path().join("1.tar.gz");
        let archive_len = std::fs::metadata(&archive).unwrap().len();

        h.clock.advance(60_000);
        let changed = finalize(
            h.repo.as_ref(),
            h.clock.as_ref(),
            1,
            RecordingOutcome::Degraded,
            Some("again".into()),
            0,
        )
        .await
        .unwrap();

        assert!(!changed);
        assert_eq!(h.repo.get(1), before);
        assert_eq!(h.repo.saves.load(Ordering::SeqCst), saves);
        assert_eq!(std::fs::metadata(&archive).unwrap().len(), archive_len);
        assert!(!h.busy.is_busy());
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let mut h = harness(GatedBackend::open());
        let mut events = h.scheduler.subscribe();
        let mut stuck = request(3, NOW - 1000);
        stuck.status = RecordingStatus::Running;
        h.repo.insert(stuck);
        h.repo.insert(request(4, NOW + 1000));

        assert_eq!(h.scheduler.recover_interrupted().await.unwrap(), 1);

        let stored = h.repo.get(3);
        assert_eq!(stored.status, RecordingStatus::Finished);
        assert_eq!(stored.outcome, Some(RecordingOutcome::Interrupted));
        assert_eq!(h.repo.get(4).status, RecordingStatus::Created);
        assert_eq!(events.recv().await.unwrap(), SchedulerEvent::Recovered { id: 3 });
    }

    #[tokio::test]
    async fn test_run_loop_dispatches_and_stops() {
        let h = harness(GatedBackend::open());
        let mut events = h.scheduler.subscribe();
        h.repo.insert(request(1, NOW - 1000));

        let cancellation = CancellationToken::new();
        let task = tokio::spawn(h.scheduler.run(cancellation.clone()));

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SchedulerEvent::Finished { id, .. }) = events.recv().await {
                    return id;
                }
            }
        })
        .await
        .expect("recording should finish");
        assert_eq!(finished, 1);

        cancellation.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("scheduler should stop")
            .unwrap();
        assert_eq!(h.repo.get(1).status, RecordingStatus::Finished);
        assert!(!h.busy.is_busy());
    }
}
