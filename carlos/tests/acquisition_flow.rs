//! End-to-end acquisition runs: SQLite store, simulated receiver, real
//! archive on disk.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;

use carlos::acquisition::{AcquisitionConfig, AcquisitionEngine};
use carlos::config::{AppConfig, DeviceBackendKind};
use carlos::database::repositories::{RecordingRepository, SqlxRecordingRepository};
use carlos::database::time::now_ms;
use carlos::database::{DbPool, init_memory_pool, run_migrations};
use carlos::device::SimulatedBackend;
use carlos::domain::{
    NewRecording, OutputLayout, RecordingId, RecordingOutcome, RecordingRequest, RecordingStatus,
};
use carlos::scheduler::{BusyFlag, RefreshSignal, Scheduler, SchedulerConfig, TickOutcome};
use carlos::services::ServiceContainer;

async fn setup_test_db() -> DbPool {
    let pool = init_memory_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

fn due_request(id: RecordingId, az_range: f64) -> RecordingRequest {
    let now = now_ms();
    NewRecording {
        user: "e2e".to_string(),
        time: now - 1000,
        frequency: 1_420_405_752,
        sample_rate: 250_000,
        gain: 20.0,
        rec_time: 100,
        wait_time: 0,
        az: 120.0,
        el: 30.0,
        az_range,
        az_step: 1.0,
        el_range: 0.0,
        el_step: 1.0,
    }
    .into_request(id, now)
}

struct Rig {
    repo: Arc<SqlxRecordingRepository>,
    busy: BusyFlag,
    scheduler: Scheduler,
    layout: OutputLayout,
    _dir: tempfile::TempDir,
}

async fn rig(backend: SimulatedBackend) -> Rig {
    let repo = Arc::new(SqlxRecordingRepository::new(setup_test_db().await));
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path());
    let engine = Arc::new(AcquisitionEngine::new(
        Arc::new(backend),
        layout.clone(),
        AcquisitionConfig::default(),
    ));
    let busy = BusyFlag::new();
    let scheduler = Scheduler::new(
        repo.clone(),
        engine,
        busy.clone(),
        RefreshSignal::new(),
        SchedulerConfig::default(),
    );
    Rig {
        repo,
        busy,
        scheduler,
        layout,
        _dir: dir,
    }
}

fn archive_entries(path: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut entries = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        entries.push((name, data));
    }
    entries.sort();
    entries
}

#[tokio::test]
async fn test_single_point_recording_end_to_end() {
    let mut rig = rig(SimulatedBackend::new().with_max_bytes_per_sec(100_000)).await;
    let request = due_request(1, 0.0);
    rig.repo.create(&request).await.unwrap();

    assert_eq!(rig.scheduler.tick().await, TickOutcome::Dispatched(1));
    assert!(rig.busy.is_busy());
    assert_eq!(
        rig.repo.find_by_id(1).await.unwrap().status,
        RecordingStatus::Running
    );

    let report = rig.scheduler.join_worker().await.unwrap();
    assert_eq!(report.outcome, RecordingOutcome::Complete, "{:?}", report.detail);
    assert_eq!(report.points_captured, 1);
    assert!(report.persisted);
    assert!(!rig.busy.is_busy());

    let stored = rig.repo.find_by_id(1).await.unwrap();
    assert_eq!(stored.status, RecordingStatus::Finished);
    assert_eq!(stored.outcome, Some(RecordingOutcome::Complete));
    assert_eq!(stored.captured_points, 1);

    let capture_path = rig.layout.output_dir(1).join("1-120.0-30.0.iq");
    let on_disk = std::fs::read(&capture_path).unwrap();
    assert!(!on_disk.is_empty());

    let entries = archive_entries(&rig.layout.archive_path(1));
    assert_eq!(entries, vec![("1-120.0-30.0.iq".to_string(), on_disk)]);
}

#[tokio::test]
async fn test_simultaneous_requests_run_one_at_a_time() {
    let mut rig = rig(SimulatedBackend::new().with_max_bytes_per_sec(50_000)).await;
    rig.repo.create(&due_request(1, 1.0)).await.unwrap();
    rig.repo.create(&due_request(2, 0.0)).await.unwrap();

    let first = match rig.scheduler.tick().await {
        TickOutcome::Dispatched(id) => id,
        other => panic!("expected a dispatch, got {other:?}"),
    };
    assert_eq!(rig.scheduler.tick().await, TickOutcome::Busy);

    let running = rig
        .repo
        .find_by_status(RecordingStatus::Running)
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, first);

    let report = rig.scheduler.join_worker().await.unwrap();
    assert_eq!(report.id, first);

    let second = match rig.scheduler.tick().await {
        TickOutcome::Dispatched(id) => id,
        other => panic!("expected a dispatch, got {other:?}"),
    };
    assert_ne!(first, second);
    rig.scheduler.join_worker().await.unwrap();

    for recording in rig.repo.list_all().await.unwrap() {
        assert_eq!(recording.status, RecordingStatus::Finished);
        assert!(rig.layout.archive_path(recording.id).exists());
    }
    assert_eq!(rig.scheduler.tick().await, TickOutcome::Idle);
}

#[tokio::test]
async fn test_no_device_still_finishes() {
    let mut rig = rig(SimulatedBackend::new().with_devices(0)).await;
    rig.repo.create(&due_request(1, 2.0)).await.unwrap();

    assert_eq!(rig.scheduler.tick().await, TickOutcome::Dispatched(1));
    let report = rig.scheduler.join_worker().await.unwrap();

    assert_eq!(report.outcome, RecordingOutcome::Degraded);
    assert_eq!(report.points_captured, 0);
    assert!(!rig.busy.is_busy());

    let stored = rig.repo.find_by_id(1).await.unwrap();
    assert_eq!(stored.status, RecordingStatus::Finished);
    assert!(stored.outcome_detail.unwrap().contains("no receiver"));
    assert!(archive_entries(&rig.layout.archive_path(1)).is_empty());
}

#[tokio::test]
async fn test_container_runs_scheduler_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let pool = setup_test_db().await;

    // Left Running by a previous process.
    let repo = SqlxRecordingRepository::new(pool.clone());
    let mut orphan = due_request(1, 0.0);
    repo.create(&orphan).await.unwrap();
    orphan
        .transition_to(RecordingStatus::Running, now_ms())
        .unwrap();
    repo.save(&orphan).await.unwrap();
    repo.create(&due_request(2, 0.0)).await.unwrap();

    let mut config = AppConfig::default();
    config.bind_address = "127.0.0.1".to_string();
    config.port = 0;
    config.record_path = dir.path().join("recordings");
    config.poll_interval_ms = 20;
    config.device.backend = DeviceBackendKind::Simulated;

    let mut container = ServiceContainer::with_pool(pool, config).await.unwrap();
    assert!(container.ids.next_id(0) > 2);
    container.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let all = container.repo.list_all().await.unwrap();
        if all.iter().all(|r| r.status == RecordingStatus::Finished) {
            let outcomes: Vec<_> = all.iter().map(|r| (r.id, r.outcome)).collect();
            assert_eq!(
                outcomes,
                vec![
                    (1, Some(RecordingOutcome::Interrupted)),
                    (2, Some(RecordingOutcome::Complete)),
                ]
            );
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "recordings did not finish: {all:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    container.shutdown_with_timeout(Duration::from_secs(5)).await;
    assert!(container.is_shutting_down());
}
