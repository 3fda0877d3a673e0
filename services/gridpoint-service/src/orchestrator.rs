//! Refresh orchestrator.
//!
//! A run re-resolves a set of cells against the authority and commits each
//! answer to the version store at the run's start time. Cells are streamed
//! through a bounded worker pool; a failed cell is recorded and skipped,
//! never fatal to the run.
//!
//! Run states: `running` then one of `succeeded`, `partially_failed`,
//! `failed`, `cancelled`. A run interrupted by a crash stays `running` until
//! it is abandoned explicitly. A run that could not log every failed cell
//! ends `failed`.

use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use gridpoint_common::{Cell, CellId};
use storage::{GridpointStore, RefreshRun, RunStatus, RunTotals, StorageError, VersionStore};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::metrics;
use crate::resolver::ResolutionClient;
use crate::throttle::{Throttle, ThrottleConfig};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("No active cells; register a partition first")]
    NoCells,

    #[error("Refresh run not found: {0}")]
    RunNotFound(i64),

    #[error("Refresh run {0} is still running")]
    RunStillRunning(i64),

    #[error("Refresh run {0} has no failed cells to retry")]
    NothingToRetry(i64),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub pool_size: usize,
    pub throttle: ThrottleConfig,
    pub systemic_failure_ratio: f64,
    pub retry_failed_immediately: bool,
    pub progress_every: u64,
}

impl RefreshSettings {
    pub fn from_config(config: &crate::config::RefreshConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            throttle: config.throttle(),
            systemic_failure_ratio: config.systemic_failure_ratio,
            retry_failed_immediately: config.retry_failed_immediately,
            progress_every: config.progress_every,
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: RefreshRun,
    pub failed_cells: Vec<CellId>,
    /// Throttle limit when the run finished.
    pub concurrency: usize,
    /// The immediate targeted retry, when one was started.
    pub retry: Option<Box<RunReport>>,
}

impl RunReport {
    /// The last run in the retry chain.
    pub fn final_run(&self) -> &RefreshRun {
        match &self.retry {
            Some(retry) => retry.final_run(),
            None => &self.run,
        }
    }
}

enum CellOutcome {
    Committed { changed: bool },
    Failed { cell_id: CellId, kind: &'static str, message: String },
}

pub struct RefreshOrchestrator {
    client: Arc<ResolutionClient>,
    store: GridpointStore,
    settings: RefreshSettings,
}

impl RefreshOrchestrator {
    pub fn new(client: Arc<ResolutionClient>, store: GridpointStore, settings: RefreshSettings) -> Self {
        Self {
            client,
            store,
            settings,
        }
    }

    /// Re-resolve every active cell.
    #[instrument(skip(self, cancel))]
    pub async fn run_refresh(&self, cancel: CancellationToken) -> OrchestratorResult<RunReport> {
        let cells = self.store.catalog().active_cells().await?;
        if cells.is_empty() {
            return Err(OrchestratorError::NoCells);
        }

        let mut report = self.execute(None, cells, &cancel).await?;

        if self.settings.retry_failed_immediately
            && report.run.status == RunStatus::PartiallyFailed
            && !cancel.is_cancelled()
        {
            info!(run_id = report.run.run_id, "Retrying failed cells immediately");
            let retry = self
                .retry_cells(report.run.run_id, &report.failed_cells, &cancel)
                .await?;
            report.retry = Some(Box::new(retry));
        }

        Ok(report)
    }

    /// Start a new run covering exactly the failed cells of `run_id`.
    #[instrument(skip(self, cancel))]
    pub async fn retry_failed(
        &self,
        run_id: i64,
        cancel: CancellationToken,
    ) -> OrchestratorResult<RunReport> {
        let runs = self.store.runs();
        let parent = runs
            .get(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))?;
        if !parent.status.is_terminal() {
            return Err(OrchestratorError::RunStillRunning(run_id));
        }

        let failed = runs.failed_cell_ids(run_id).await?;
        self.retry_cells(run_id, &failed, &cancel).await
    }

    async fn retry_cells(
        &self,
        run_id: i64,
        failed: &[CellId],
        cancel: &CancellationToken,
    ) -> OrchestratorResult<RunReport> {
        let cells = self.store.catalog().active_cells_by_id(failed).await?;
        if cells.is_empty() {
            return Err(OrchestratorError::NothingToRetry(run_id));
        }
        if cells.len() < failed.len() {
            warn!(
                run_id = run_id,
                skipped = failed.len() - cells.len(),
                "Some failed cells were retired and will not be retried"
            );
        }

        self.execute(Some(run_id), cells, cancel).await
    }

    /// Runs still `running` that started more than `older_than` ago.
    pub async fn stuck_runs(&self, older_than: ChronoDuration) -> OrchestratorResult<Vec<RefreshRun>> {
        Ok(self.store.runs().stuck(Utc::now() - older_than).await?)
    }

    /// Close an interrupted run as `abandoned`.
    pub async fn abandon_run(&self, run_id: i64) -> OrchestratorResult<RefreshRun> {
        match self.store.runs().abandon(run_id, Utc::now()).await {
            Err(StorageError::RunNotFound(id)) => Err(OrchestratorError::RunNotFound(id)),
            other => Ok(other?),
        }
    }

    async fn execute(
        &self,
        parent_run_id: Option<i64>,
        cells: Vec<Cell>,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<RunReport> {
        let runs = self.store.runs();
        let versions = self.store.versions();
        let run = runs.start(parent_run_id, Utc::now()).await?;
        let started_at: DateTime<Utc> = run.started_at;
        let run_id = run.run_id;
        let total = cells.len();
        let clock = Instant::now();

        info!(
            run_id = run_id,
            parent_run_id = ?parent_run_id,
            cells = total,
            pool_size = self.settings.pool_size,
            "Refresh run started"
        );

        let throttle = Throttle::new("refresh", self.settings.throttle.clone());

        // Each cell runs as its own task so in-flight commits keep going while
        // this loop waits on the store. Once cancelled no new cell starts;
        // cells already started finish and keep their commits.
        let outcomes = stream::iter(cells)
            .take_until(cancel.cancelled())
            .map(|cell| {
                let cell_id = cell.id;
                let task = tokio::spawn(refresh_cell(
                    Arc::clone(&self.client),
                    throttle.clone(),
                    versions.clone(),
                    cell,
                    started_at,
                ));
                async move {
                    task.await.unwrap_or_else(|e| CellOutcome::Failed {
                        cell_id,
                        kind: "internal",
                        message: e.to_string(),
                    })
                }
            })
            .buffer_unordered(self.settings.pool_size.max(1));
        let mut outcomes = pin!(outcomes);

        let mut totals = RunTotals::default();
        let mut failed_cells = Vec::new();
        let mut unrecorded: Vec<(CellId, &'static str, String)> = Vec::new();
        let progress_every = self.settings.progress_every.max(1);

        while let Some(outcome) = outcomes.next().await {
            totals.attempted += 1;
            match outcome {
                CellOutcome::Committed { changed } => {
                    if changed {
                        totals.changed += 1;
                        metrics::record_cell("changed");
                    } else {
                        metrics::record_cell("unchanged");
                    }
                }
                CellOutcome::Failed {
                    cell_id,
                    kind,
                    message,
                } => {
                    totals.failed += 1;
                    metrics::record_cell(kind);
                    failed_cells.push(cell_id);
                    warn!(run_id = run_id, cell_id = cell_id.0, kind = kind, error = %message, "Cell failed");
                    if let Err(e) = runs.record_failure(run_id, cell_id, kind, &message).await {
                        warn!(run_id = run_id, cell_id = cell_id.0, error = %e, "Failed to record cell failure; will retry");
                        unrecorded.push((cell_id, kind, message));
                    }
                }
            }

            if totals.attempted % progress_every == 0 {
                info!(
                    run_id = run_id,
                    processed = totals.attempted,
                    total = total,
                    changed = totals.changed,
                    failed = totals.failed,
                    concurrency = throttle.limit(),
                    "Refresh progress"
                );
                if let Err(e) = runs.update_progress(run_id, totals).await {
                    warn!(run_id = run_id, error = %e, "Failed to checkpoint run progress");
                }
            }
        }

        // A failure missing from the log would be skipped by a later retry,
        // so a run that cannot record one is not allowed to pass as partial.
        let mut lost = 0usize;
        for (cell_id, kind, message) in unrecorded {
            if let Err(e) = runs.record_failure(run_id, cell_id, kind, &message).await {
                error!(run_id = run_id, cell_id = cell_id.0, error = %e, "Cell failure could not be recorded");
                lost += 1;
            }
        }

        let cancelled = cancel.is_cancelled() && (totals.attempted as usize) < total;
        let status = if lost > 0 {
            RunStatus::Failed
        } else {
            classify(totals, cancelled, self.settings.systemic_failure_ratio)
        };
        let run = runs.finish(run_id, status, totals, Utc::now()).await?;
        let concurrency = throttle.limit();

        let elapsed = clock.elapsed().as_secs_f64();
        metrics::record_run(status.as_str(), elapsed);
        info!(
            run_id = run_id,
            status = %status,
            attempted = totals.attempted,
            changed = totals.changed,
            failed = totals.failed,
            unrecorded_failures = lost,
            concurrency = concurrency,
            elapsed_secs = elapsed,
            "Refresh run finished"
        );

        failed_cells.sort();
        Ok(RunReport {
            run,
            failed_cells,
            concurrency,
            retry: None,
        })
    }
}

async fn refresh_cell(
    client: Arc<ResolutionClient>,
    throttle: Throttle,
    versions: VersionStore,
    cell: Cell,
    started_at: DateTime<Utc>,
) -> CellOutcome {
    let resolution = match client.resolve(cell.centroid, &throttle).await {
        Ok(resolution) => resolution,
        Err(e) => {
            return CellOutcome::Failed {
                cell_id: cell.id,
                kind: e.kind(),
                message: e.to_string(),
            }
        }
    };

    match versions
        .commit_resolution(cell.id, &resolution.gridpoint, &resolution.metadata, started_at)
        .await
    {
        Ok(outcome) => CellOutcome::Committed {
            changed: outcome.is_change(),
        },
        Err(e) => CellOutcome::Failed {
            cell_id: cell.id,
            kind: "storage",
            message: e.to_string(),
        },
    }
}

/// Terminal status for a run's counters.
pub fn classify(totals: RunTotals, cancelled: bool, systemic_failure_ratio: f64) -> RunStatus {
    if cancelled {
        return RunStatus::Cancelled;
    }
    if totals.failed == 0 {
        return RunStatus::Succeeded;
    }
    let ratio = totals.failed as f64 / totals.attempted.max(1) as f64;
    if totals.failed >= totals.attempted || ratio >= systemic_failure_ratio {
        RunStatus::Failed
    } else {
        RunStatus::PartiallyFailed
    }
}
