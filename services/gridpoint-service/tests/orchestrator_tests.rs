//! Refresh run tests against an in-memory store and a scripted authority.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use gridpoint_common::{CellId, GeoPoint, GridpointId, PointMetadata, RasterCell};
use gridpoint_service::orchestrator::{OrchestratorError, RefreshOrchestrator, RefreshSettings};
use gridpoint_service::resolver::{
    CallError, PointResolution, PointsApi, ResolutionClient, RetryPolicy,
};
use gridpoint_service::throttle::ThrottleConfig;
use storage::{GridpointStore, RunStatus};
use test_utils::generators::temp_db_path;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

const BASE_LAT: f64 = 39.0;
const STEP: f64 = 0.01;

/// Answers from a closure keyed by the coordinate.
struct FnApi<F>(F);

#[async_trait]
impl<F> PointsApi for FnApi<F>
where
    F: Fn(f64, f64) -> Result<PointResolution, CallError> + Send + Sync,
{
    async fn fetch_point(&self, lat: f64, lon: f64) -> Result<PointResolution, CallError> {
        (self.0)(lat, lon)
    }
}

fn resolution(office: &str, x: u32, y: u32) -> Result<PointResolution, CallError> {
    Ok(PointResolution {
        gridpoint: GridpointId::new(office, x, y).unwrap(),
        metadata: PointMetadata::default(),
        echoed: None,
    })
}

/// Position of a test cell in registration order, recovered from its centroid.
fn slot(lat: f64) -> u32 {
    ((lat - BASE_LAT) / STEP).round() as u32
}

fn not_found() -> Result<PointResolution, CallError> {
    Err(CallError::Rejected {
        status: 404,
        detail: "Unable to provide data for requested point".into(),
    })
}

async fn store_with_cells(count: i64) -> GridpointStore {
    let store = GridpointStore::open_memory().await.unwrap();
    let squares = (0..count).map(|i| {
        (
            RasterCell::new(0, i),
            GeoPoint::new(BASE_LAT + i as f64 * STEP, -97.0),
        )
    });
    store
        .catalog()
        .register_partition(2500.0, squares)
        .await
        .unwrap();
    store
}

fn settings() -> RefreshSettings {
    RefreshSettings {
        pool_size: 4,
        throttle: ThrottleConfig::unpaced(4),
        systemic_failure_ratio: 0.5,
        retry_failed_immediately: false,
        progress_every: 3,
    }
}

fn orchestrator<F>(store: &GridpointStore, api: F, settings: RefreshSettings) -> RefreshOrchestrator
where
    F: Fn(f64, f64) -> Result<PointResolution, CallError> + Send + Sync + 'static,
{
    orchestrator_with(store, Arc::new(FnApi(api)), settings)
}

fn orchestrator_with(
    store: &GridpointStore,
    api: Arc<dyn PointsApi>,
    settings: RefreshSettings,
) -> RefreshOrchestrator {
    let policy = RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    };
    let client = ResolutionClient::new(api, policy);
    RefreshOrchestrator::new(Arc::new(client), store.clone(), settings)
}

/// Answers after a delay and tracks how many calls overlap. Optionally
/// cancels a token when the given call starts.
struct SlowApi {
    delay: Duration,
    started: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    cancel_at: Option<(u32, CancellationToken)>,
}

impl SlowApi {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            cancel_at: None,
        }
    }
}

#[async_trait]
impl PointsApi for SlowApi {
    async fn fetch_point(&self, lat: f64, _lon: f64) -> Result<PointResolution, CallError> {
        let started = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some((at, token)) = &self.cancel_at {
            if started == *at {
                token.cancel();
            }
        }

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        resolution("TOP", 30, slot(lat))
    }
}

/// Cell ids of the given slots, in id order.
async fn ids_of(store: &GridpointStore, slots: &[u32]) -> Vec<CellId> {
    let mut ids: Vec<CellId> = store
        .catalog()
        .active_cells()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| slots.contains(&slot(c.centroid.lat)))
        .map(|c| c.id)
        .collect();
    ids.sort();
    ids
}

// ============================================================================
// Run outcomes
// ============================================================================

#[tokio::test]
async fn test_all_cells_succeed() {
    let store = store_with_cells(6).await;
    let orch = orchestrator(&store, |lat, _| resolution("TOP", 30, slot(lat)), settings());

    let report = orch.run_refresh(CancellationToken::new()).await.unwrap();

    assert_eq!(report.run.status, RunStatus::Succeeded);
    assert_eq!(report.run.cells_attempted, 6);
    assert_eq!(report.run.cells_changed, 6);
    assert_eq!(report.run.cells_failed, 0);
    assert!(report.run.completed_at.is_some());
    assert!(report.failed_cells.is_empty());
    assert_eq!(store.versions().current_count().await.unwrap(), 6);
}

#[tokio::test]
async fn test_partial_failure_lists_exact_cells() {
    let store = store_with_cells(10).await;
    let failing: HashSet<u32> = [3, 7].into_iter().collect();
    let orch = orchestrator(
        &store,
        move |lat, _| {
            if failing.contains(&slot(lat)) {
                not_found()
            } else {
                resolution("TOP", 30, slot(lat))
            }
        },
        settings(),
    );

    let report = orch.run_refresh(CancellationToken::new()).await.unwrap();
    let expected = ids_of(&store, &[3, 7]).await;

    assert_eq!(report.run.status, RunStatus::PartiallyFailed);
    assert_eq!(report.run.cells_attempted, 10);
    assert_eq!(report.run.cells_changed, 8);
    assert_eq!(report.run.cells_failed, 2);
    assert_eq!(report.failed_cells, expected);

    let runs = store.runs();
    assert_eq!(runs.failed_cell_ids(report.run.run_id).await.unwrap(), expected);
    let failures = runs.failures(report.run.run_id).await.unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.kind == "rejected"));

    // Successes are committed, failures leave no row
    let versions = store.versions();
    assert_eq!(versions.current_count().await.unwrap(), 8);
    for id in expected {
        assert!(versions.current(id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_systemic_failure_marks_run_failed() {
    let store = store_with_cells(10).await;
    let orch = orchestrator(
        &store,
        |lat, _| {
            if slot(lat) < 6 {
                Err(CallError::Malformed("missing properties.gridX".into()))
            } else {
                resolution("TOP", 30, slot(lat))
            }
        },
        settings(),
    );

    let report = orch.run_refresh(CancellationToken::new()).await.unwrap();

    assert_eq!(report.run.status, RunStatus::Failed);
    assert_eq!(report.run.cells_failed, 6);
    // Successful cells are still committed
    assert_eq!(store.versions().current_count().await.unwrap(), 4);
}

#[tokio::test]
async fn test_every_cell_failing_marks_run_failed() {
    let store = store_with_cells(3).await;
    let mut lenient = settings();
    lenient.systemic_failure_ratio = 1.0;
    let orch = orchestrator(
        &store,
        |_, _| Err(CallError::Transient("HTTP 503".into())),
        lenient,
    );

    let report = orch.run_refresh(CancellationToken::new()).await.unwrap();

    assert_eq!(report.run.status, RunStatus::Failed);
    let failures = store.runs().failures(report.run.run_id).await.unwrap();
    assert!(failures.iter().all(|f| f.kind == "exhausted"));
}

#[tokio::test]
async fn test_no_cells() {
    let store = GridpointStore::open_memory().await.unwrap();
    let orch = orchestrator(&store, |_, _| resolution("TOP", 1, 1), settings());

    let err = orch.run_refresh(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NoCells));
    assert!(store.runs().latest().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let store = store_with_cells(5).await;
    let orch = orchestrator(&store, |lat, _| resolution("TOP", 30, slot(lat)), settings());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = orch.run_refresh(cancel).await.unwrap();

    assert_eq!(report.run.status, RunStatus::Cancelled);
    assert_eq!(report.run.cells_attempted, 0);
    assert_eq!(store.versions().current_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_in_flight_commits() {
    let store = store_with_cells(40).await;
    let cancel = CancellationToken::new();
    let api = Arc::new(SlowApi {
        cancel_at: Some((10, cancel.clone())),
        ..SlowApi::new(Duration::from_millis(20))
    });
    let orch = orchestrator_with(&store, api.clone(), settings());

    let report = orch.run_refresh(cancel).await.unwrap();

    let started = u64::from(api.started.load(Ordering::SeqCst));
    assert_eq!(report.run.status, RunStatus::Cancelled);
    assert!(report.run.completed_at.is_some());
    assert!(started >= 10 && started < 40, "started = {started}");
    // Every cell that started was finished and committed
    assert_eq!(report.run.cells_attempted, started);
    assert_eq!(report.run.cells_failed, 0);
    assert_eq!(store.versions().current_count().await.unwrap(), started as i64);
    assert_eq!(api.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pool_size_bounds_concurrent_calls() {
    let store = store_with_cells(20).await;
    let api = Arc::new(SlowApi::new(Duration::from_millis(10)));
    let mut narrow = settings();
    narrow.pool_size = 3;
    narrow.throttle = ThrottleConfig::unpaced(8);
    let orch = orchestrator_with(&store, api.clone(), narrow);

    let report = orch.run_refresh(CancellationToken::new()).await.unwrap();

    assert_eq!(report.run.status, RunStatus::Succeeded);
    assert_eq!(report.run.cells_attempted, 20);
    assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rate_limit_during_run_reduces_concurrency() {
    let store = store_with_cells(6).await;
    let limited = Arc::new(AtomicU32::new(0));
    let seen = limited.clone();
    let orch = orchestrator(
        &store,
        move |lat, _| {
            if slot(lat) == 0 && seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CallError::RateLimited {
                    retry_after: Some(Duration::ZERO),
                })
            } else {
                resolution("TOP", 30, slot(lat))
            }
        },
        settings(),
    );

    let report = orch.run_refresh(CancellationToken::new()).await.unwrap();

    // The 429 was retried, and the limit halved from 4 without recovering
    assert_eq!(report.run.status, RunStatus::Succeeded);
    assert_eq!(report.run.cells_changed, 6);
    assert_eq!(limited.load(Ordering::SeqCst), 2);
    assert_eq!(report.concurrency, 2);
}

#[tokio::test]
async fn test_commit_failure_is_recorded_as_storage() {
    let store = store_with_cells(4).await;
    let blocked = ids_of(&store, &[2]).await[0];
    // A version dated after the run starts cannot be superseded by it
    store
        .versions()
        .commit(
            blocked,
            &GridpointId::new("TOP", 99, 99).unwrap(),
            Utc::now() + ChronoDuration::days(1),
        )
        .await
        .unwrap();

    let orch = orchestrator(&store, |lat, _| resolution("TOP", 30, slot(lat)), settings());
    let report = orch.run_refresh(CancellationToken::new()).await.unwrap();

    assert_eq!(report.run.status, RunStatus::PartiallyFailed);
    assert_eq!(report.failed_cells, vec![blocked]);
    let failures = store.runs().failures(report.run.run_id).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].cell_id, blocked);
    assert_eq!(failures[0].kind, "storage");
}

#[tokio::test]
async fn test_unloggable_failure_fails_the_run() {
    let (_dir, path) = temp_db_path("gridpoints.db");
    let store = GridpointStore::open(&path).await.unwrap();
    store
        .catalog()
        .register_partition(
            2500.0,
            (0..4).map(|i| {
                (
                    RasterCell::new(0, i),
                    GeoPoint::new(BASE_LAT + i as f64 * STEP, -97.0),
                )
            }),
        )
        .await
        .unwrap();

    // Make the failure log reject every insert
    let admin = sqlx::SqlitePool::connect(&format!("sqlite:{}", path.display()))
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_failures BEFORE INSERT ON refresh_run_failures \
         BEGIN SELECT RAISE(ABORT, 'failure log unavailable'); END",
    )
    .execute(&admin)
    .await
    .unwrap();
    admin.close().await;

    let orch = orchestrator(
        &store,
        |lat, _| {
            if slot(lat) == 1 {
                not_found()
            } else {
                resolution("TOP", 30, slot(lat))
            }
        },
        settings(),
    );
    let report = orch.run_refresh(CancellationToken::new()).await.unwrap();

    // One failure in four would be partial, but it is missing from the log
    assert_eq!(report.run.status, RunStatus::Failed);
    assert_eq!(report.run.cells_failed, 1);
    assert_eq!(report.failed_cells, ids_of(&store, &[1]).await);
    assert!(store
        .runs()
        .failed_cell_ids(report.run.run_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_metadata_is_stored_with_resolution() {
    let store = store_with_cells(2).await;
    let orch = orchestrator(
        &store,
        |lat, _| {
            Ok(PointResolution {
                gridpoint: GridpointId::new("TOP", 30, slot(lat)).unwrap(),
                metadata: PointMetadata {
                    forecast_zone_url: Some("https://api.weather.gov/zones/forecast/KSZ024".into()),
                    time_zone: Some("America/Chicago".into()),
                    ..PointMetadata::default()
                },
                echoed: None,
            })
        },
        settings(),
    );

    orch.run_refresh(CancellationToken::new()).await.unwrap();

    for id in ids_of(&store, &[0, 1]).await {
        let metadata = store.versions().metadata(id).await.unwrap().unwrap();
        assert_eq!(metadata.time_zone.as_deref(), Some("America/Chicago"));
        assert_eq!(
            metadata.forecast_zone_url.as_deref(),
            Some("https://api.weather.gov/zones/forecast/KSZ024")
        );
    }
}

// ============================================================================
// Versioning across runs
// ============================================================================

#[tokio::test]
async fn test_gridpoint_change_across_runs() {
    let store = GridpointStore::open_memory().await.unwrap();
    let (lat, lon) = test_utils::fixtures::points::TOPEKA;
    store
        .catalog()
        .register_partition(2500.0, [(RasterCell::new(708, -43), GeoPoint::new(lat, lon))])
        .await
        .unwrap();
    let cell_id = store.catalog().active_cells().await.unwrap()[0].id;

    let grid_y = Arc::new(AtomicU32::new(81));
    let answer = grid_y.clone();
    let orch = orchestrator(
        &store,
        move |_, _| resolution("TOP", 32, answer.load(Ordering::SeqCst)),
        settings(),
    );

    let first = orch.run_refresh(CancellationToken::new()).await.unwrap();
    let current = store.versions().current(cell_id).await.unwrap().unwrap();
    assert_eq!(current.gridpoint.to_string(), "TOP/32,81");
    assert_eq!(current.effective_from, first.run.started_at);
    assert_eq!(current.effective_to, None);

    grid_y.store(82, Ordering::SeqCst);
    let second = orch.run_refresh(CancellationToken::new()).await.unwrap();
    assert_eq!(second.run.cells_changed, 1);

    let history = store.versions().history(cell_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].gridpoint.to_string(), "TOP/32,81");
    assert_eq!(history[0].effective_to, Some(second.run.started_at));
    assert!(!history[0].is_current);
    assert_eq!(history[1].gridpoint.to_string(), "TOP/32,82");
    assert_eq!(history[1].effective_from, second.run.started_at);
    assert!(history[1].is_current);
}

#[tokio::test]
async fn test_unchanged_run_writes_nothing() {
    let store = store_with_cells(4).await;
    let orch = orchestrator(&store, |lat, _| resolution("TOP", 30, slot(lat)), settings());

    orch.run_refresh(CancellationToken::new()).await.unwrap();
    let second = orch.run_refresh(CancellationToken::new()).await.unwrap();

    assert_eq!(second.run.status, RunStatus::Succeeded);
    assert_eq!(second.run.cells_changed, 0);
    let stats = store.versions().stats().await.unwrap();
    assert_eq!(stats.total_rows, 4);
    assert_eq!(stats.current_rows, 4);
}

// ============================================================================
// Retrying failed cells
// ============================================================================

/// Fails the given slots on their first call only.
fn flaky(slots: &[u32]) -> impl Fn(f64, f64) -> Result<PointResolution, CallError> + Send + Sync {
    let failing: HashSet<u32> = slots.iter().copied().collect();
    let calls: Mutex<HashMap<u32, u32>> = Mutex::new(HashMap::new());
    move |lat, _| {
        let slot = slot(lat);
        let mut calls = calls.lock().unwrap();
        let count = calls.entry(slot).or_insert(0);
        *count += 1;
        if failing.contains(&slot) && *count == 1 {
            not_found()
        } else {
            resolution("TOP", 30, slot)
        }
    }
}

#[tokio::test]
async fn test_retry_failed_targets_failed_cells() {
    let store = store_with_cells(8).await;
    let orch = orchestrator(&store, flaky(&[1, 5]), settings());

    let first = orch.run_refresh(CancellationToken::new()).await.unwrap();
    assert_eq!(first.run.status, RunStatus::PartiallyFailed);

    let retry = orch
        .retry_failed(first.run.run_id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(retry.run.parent_run_id, Some(first.run.run_id));
    assert_eq!(retry.run.status, RunStatus::Succeeded);
    assert_eq!(retry.run.cells_attempted, 2);
    assert_eq!(retry.run.cells_changed, 2);
    assert_eq!(store.versions().current_count().await.unwrap(), 8);

    // The retry itself has nothing left to retry
    let err = orch
        .retry_failed(retry.run.run_id, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NothingToRetry(_)));
}

#[tokio::test]
async fn test_retry_failed_immediately() {
    let store = store_with_cells(8).await;
    let mut eager = settings();
    eager.retry_failed_immediately = true;
    let orch = orchestrator(&store, flaky(&[2]), eager);

    let report = orch.run_refresh(CancellationToken::new()).await.unwrap();

    assert_eq!(report.run.status, RunStatus::PartiallyFailed);
    let retry = report.retry.as_ref().expect("retry run");
    assert_eq!(retry.run.parent_run_id, Some(report.run.run_id));
    assert_eq!(report.final_run().status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_retry_unknown_or_running_run() {
    let store = store_with_cells(2).await;
    let orch = orchestrator(&store, |_, _| resolution("TOP", 1, 1), settings());

    let err = orch
        .retry_failed(999, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::RunNotFound(999)));

    let running = store.runs().start(None, Utc::now()).await.unwrap();
    let err = orch
        .retry_failed(running.run_id, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::RunStillRunning(id) if id == running.run_id));
}

// ============================================================================
// Interrupted runs
// ============================================================================

#[tokio::test]
async fn test_stuck_run_can_be_abandoned() {
    let store = store_with_cells(2).await;
    let orch = orchestrator(&store, |_, _| resolution("TOP", 1, 1), settings());

    let stale = store
        .runs()
        .start(None, Utc::now() - ChronoDuration::hours(3))
        .await
        .unwrap();
    let fresh = store.runs().start(None, Utc::now()).await.unwrap();

    let stuck = orch.stuck_runs(ChronoDuration::hours(1)).await.unwrap();
    let stuck_ids: Vec<i64> = stuck.iter().map(|r| r.run_id).collect();
    assert_eq!(stuck_ids, vec![stale.run_id]);
    assert!(!stuck_ids.contains(&fresh.run_id));

    let abandoned = orch.abandon_run(stale.run_id).await.unwrap();
    assert_eq!(abandoned.status, RunStatus::Abandoned);
    assert!(abandoned.completed_at.is_some());
    assert!(orch.stuck_runs(ChronoDuration::hours(1)).await.unwrap().is_empty());

    let err = orch.abandon_run(12345).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RunNotFound(12345)));
}
