//! Refresh run log.
//!
//! A run row is written when a refresh starts and finalized exactly once.
//! Runs interrupted by a crash stay `running` until an operator abandons
//! them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gridpoint_common::CellId;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{StorageError, StorageResult};
use crate::store::{decode_ts, encode_ts, storable};

/// Refresh run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
    Cancelled,
    Abandoned,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "partially_failed" => Ok(Self::PartiallyFailed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(StorageError::InvalidRow(format!("unknown run status {other:?}"))),
        }
    }
}

/// Per-run cell counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub attempted: u64,
    pub changed: u64,
    pub failed: u64,
}

/// A refresh run as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshRun {
    pub run_id: i64,
    pub parent_run_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cells_attempted: u64,
    pub cells_changed: u64,
    pub cells_failed: u64,
    pub status: RunStatus,
}

/// One failed cell of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub run_id: i64,
    pub cell_id: CellId,
    pub kind: String,
    pub message: String,
}

type RunRow = (i64, Option<i64>, String, Option<String>, i64, i64, i64, String);

const RUN_COLUMNS: &str = "run_id, parent_run_id, started_at, completed_at, \
     cells_attempted, cells_changed, cells_failed, status";

fn run_from_row(row: RunRow) -> StorageResult<RefreshRun> {
    let (run_id, parent_run_id, started, completed, attempted, changed, failed, status) = row;
    Ok(RefreshRun {
        run_id,
        parent_run_id,
        started_at: decode_ts(&started)?,
        completed_at: completed.as_deref().map(decode_ts).transpose()?,
        cells_attempted: attempted as u64,
        cells_changed: changed as u64,
        cells_failed: failed as u64,
        status: status.parse()?,
    })
}

/// Handle for run bookkeeping.
#[derive(Debug, Clone)]
pub struct RunLog {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl RunLog {
    pub(crate) fn new(pool: SqlitePool, writer: Arc<Mutex<()>>) -> Self {
        Self { pool, writer }
    }

    /// Open a new `running` run.
    pub async fn start(
        &self,
        parent_run_id: Option<i64>,
        started_at: DateTime<Utc>,
    ) -> StorageResult<RefreshRun> {
        let started_at = storable(started_at);
        let _write = self.writer.lock().await;

        let run_id = sqlx::query(
            "INSERT INTO refresh_runs (parent_run_id, started_at, status) VALUES (?, ?, 'running')",
        )
        .bind(parent_run_id)
        .bind(encode_ts(started_at))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!(run_id = run_id, parent_run_id = ?parent_run_id, "Started refresh run");

        Ok(RefreshRun {
            run_id,
            parent_run_id,
            started_at,
            completed_at: None,
            cells_attempted: 0,
            cells_changed: 0,
            cells_failed: 0,
            status: RunStatus::Running,
        })
    }

    /// Checkpoint counters of a run that is still going.
    pub async fn update_progress(&self, run_id: i64, totals: RunTotals) -> StorageResult<()> {
        let _write = self.writer.lock().await;
        sqlx::query(
            r#"
            UPDATE refresh_runs
            SET cells_attempted = ?, cells_changed = ?, cells_failed = ?
            WHERE run_id = ? AND completed_at IS NULL
            "#,
        )
        .bind(totals.attempted as i64)
        .bind(totals.changed as i64)
        .bind(totals.failed as i64)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed cell. A second failure for the same cell in the same
    /// run replaces the first.
    pub async fn record_failure(
        &self,
        run_id: i64,
        cell_id: CellId,
        kind: &str,
        message: &str,
    ) -> StorageResult<()> {
        let _write = self.writer.lock().await;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO refresh_run_failures (run_id, cell_id, kind, message)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(cell_id.0)
        .bind(kind)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Finalize a run. Fails if the run is unknown or already finished.
    pub async fn finish(
        &self,
        run_id: i64,
        status: RunStatus,
        totals: RunTotals,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<RefreshRun> {
        let write_guard = self.writer.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE refresh_runs
            SET status = ?, completed_at = ?,
                cells_attempted = ?, cells_changed = ?, cells_failed = ?
            WHERE run_id = ? AND completed_at IS NULL
            "#,
        )
        .bind(status.as_str())
        .bind(encode_ts(storable(completed_at)))
        .bind(totals.attempted as i64)
        .bind(totals.changed as i64)
        .bind(totals.failed as i64)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        drop(write_guard);

        if result.rows_affected() == 0 {
            return match self.get(run_id).await? {
                Some(_) => Err(StorageError::RunAlreadyFinished(run_id)),
                None => Err(StorageError::RunNotFound(run_id)),
            };
        }

        info!(
            run_id = run_id,
            status = %status,
            attempted = totals.attempted,
            changed = totals.changed,
            failed = totals.failed,
            "Finished refresh run"
        );

        self.get(run_id).await?.ok_or(StorageError::RunNotFound(run_id))
    }

    /// Close an interrupted run as `abandoned`, keeping its last counters.
    pub async fn abandon(&self, run_id: i64, at: DateTime<Utc>) -> StorageResult<RefreshRun> {
        let run = self
            .get(run_id)
            .await?
            .ok_or(StorageError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(StorageError::RunAlreadyFinished(run_id));
        }

        let failed = self.failure_count(run_id).await?;
        let totals = RunTotals {
            attempted: run.cells_attempted,
            changed: run.cells_changed,
            failed: run.cells_failed.max(failed),
        };
        warn!(run_id = run_id, "Abandoning refresh run");
        self.finish(run_id, RunStatus::Abandoned, totals, at).await
    }

    pub async fn get(&self, run_id: i64) -> StorageResult<Option<RefreshRun>> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM refresh_runs WHERE run_id = ?"))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(run_from_row).transpose()
    }

    /// Most recent runs first.
    pub async fn list(&self, limit: usize) -> StorageResult<Vec<RefreshRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM refresh_runs ORDER BY run_id DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(run_from_row).collect()
    }

    pub async fn latest(&self) -> StorageResult<Option<RefreshRun>> {
        Ok(self.list(1).await?.into_iter().next())
    }

    /// Runs still `running` that started before `started_before`.
    pub async fn stuck(&self, started_before: DateTime<Utc>) -> StorageResult<Vec<RefreshRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM refresh_runs
            WHERE status = 'running' AND started_at < ?
            ORDER BY run_id ASC
            "#
        ))
        .bind(encode_ts(storable(started_before)))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(run_from_row).collect()
    }

    pub async fn failures(&self, run_id: i64) -> StorageResult<Vec<RunFailure>> {
        let rows: Vec<(i64, i64, String, String)> = sqlx::query_as(
            r#"
            SELECT run_id, cell_id, kind, message
            FROM refresh_run_failures
            WHERE run_id = ?
            ORDER BY cell_id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(run_id, cell_id, kind, message)| RunFailure {
                run_id,
                cell_id: CellId(cell_id),
                kind,
                message,
            })
            .collect())
    }

    pub async fn failed_cell_ids(&self, run_id: i64) -> StorageResult<Vec<CellId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT cell_id FROM refresh_run_failures WHERE run_id = ? ORDER BY cell_id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| CellId(id)).collect())
    }

    async fn failure_count(&self, run_id: i64) -> StorageResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM refresh_run_failures WHERE run_id = ?")
                .bind(run_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GridpointStore;
    use chrono::Duration;

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = GridpointStore::open_memory().await.unwrap();
        let runs = store.runs();

        let run = runs.start(None, Utc::now()).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);

        runs.record_failure(run.run_id, CellId(7), "rejected", "HTTP 404")
            .await
            .unwrap();
        runs.record_failure(run.run_id, CellId(3), "exhausted", "5 attempts")
            .await
            .unwrap();

        let totals = RunTotals {
            attempted: 10,
            changed: 4,
            failed: 2,
        };
        let finished = runs
            .finish(run.run_id, RunStatus::PartiallyFailed, totals, Utc::now())
            .await
            .unwrap();
        assert_eq!(finished.status, RunStatus::PartiallyFailed);
        assert_eq!(finished.cells_failed, 2);
        assert!(finished.completed_at.is_some());

        assert_eq!(
            runs.failed_cell_ids(run.run_id).await.unwrap(),
            vec![CellId(3), CellId(7)]
        );
        assert_eq!(runs.failures(run.run_id).await.unwrap()[1].kind, "rejected");
    }

    #[tokio::test]
    async fn test_finished_run_is_immutable() {
        let store = GridpointStore::open_memory().await.unwrap();
        let runs = store.runs();

        let run = runs.start(None, Utc::now()).await.unwrap();
        runs.finish(run.run_id, RunStatus::Succeeded, RunTotals::default(), Utc::now())
            .await
            .unwrap();

        let err = runs
            .finish(run.run_id, RunStatus::Failed, RunTotals::default(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RunAlreadyFinished(_)));

        let err = runs
            .finish(999, RunStatus::Failed, RunTotals::default(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound(999)));
    }

    #[tokio::test]
    async fn test_stuck_and_abandon() {
        let store = GridpointStore::open_memory().await.unwrap();
        let runs = store.runs();

        let old = runs
            .start(None, Utc::now() - Duration::hours(5))
            .await
            .unwrap();
        let fresh = runs.start(None, Utc::now()).await.unwrap();
        runs.update_progress(
            old.run_id,
            RunTotals {
                attempted: 50,
                changed: 5,
                failed: 0,
            },
        )
        .await
        .unwrap();

        let stuck = runs.stuck(Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].run_id, old.run_id);
        assert_eq!(stuck[0].cells_attempted, 50);

        let abandoned = runs.abandon(old.run_id, Utc::now()).await.unwrap();
        assert_eq!(abandoned.status, RunStatus::Abandoned);
        assert_eq!(abandoned.cells_attempted, 50);
        assert!(runs.abandon(old.run_id, Utc::now()).await.is_err());

        let listed = runs.list(10).await.unwrap();
        assert_eq!(listed[0].run_id, fresh.run_id);
        assert_eq!(runs.latest().await.unwrap().unwrap().run_id, fresh.run_id);
    }

    #[tokio::test]
    async fn test_retry_run_links_parent() {
        let store = GridpointStore::open_memory().await.unwrap();
        let runs = store.runs();

        let parent = runs.start(None, Utc::now()).await.unwrap();
        let child = runs.start(Some(parent.run_id), Utc::now()).await.unwrap();
        let stored = runs.get(child.run_id).await.unwrap().unwrap();
        assert_eq!(stored.parent_run_id, Some(parent.run_id));
    }

    #[test]
    fn test_status_strings_roundtrip() {
        for status in [
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::PartiallyFailed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Abandoned,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }
}
