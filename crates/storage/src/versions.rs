//! SCD2 version store for cell to gridpoint mappings.
//!
//! Each cell has a contiguous chain of half-open intervals
//! `[effective_from, effective_to)`. The last one is open (`effective_to`
//! NULL) and flagged `is_current`. A partial unique index allows at most one
//! current row per cell.
//!
//! The descriptive fields returned next to a gridpoint (forecast office,
//! zone and station URLs, time zone, radar) live in `cell_metadata`, one row
//! per cell, overwritten with the latest answer. They never open a version.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gridpoint_common::{CellId, GridpointId, PointMetadata};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::store::{decode_ts, encode_ts, storable};

/// One interval of a cell's mapping history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridpointVersion {
    pub version_id: i64,
    pub cell_id: CellId,
    pub gridpoint: GridpointId,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

impl GridpointVersion {
    /// True when `at` falls inside `[effective_from, effective_to)`.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_to.map_or(true, |to| at < to)
    }
}

/// Result of a `commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The cell had no current row.
    Inserted(GridpointVersion),
    /// The current row was closed and replaced.
    Superseded {
        previous: GridpointVersion,
        current: GridpointVersion,
    },
    /// The gridpoint matched the current row; nothing was written.
    Unchanged(GridpointVersion),
}

impl CommitOutcome {
    /// True when the commit wrote a row.
    pub fn is_change(&self) -> bool {
        !matches!(self, CommitOutcome::Unchanged(_))
    }

    pub fn current(&self) -> &GridpointVersion {
        match self {
            CommitOutcome::Inserted(v) | CommitOutcome::Unchanged(v) => v,
            CommitOutcome::Superseded { current, .. } => current,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VersionStats {
    pub current_rows: i64,
    pub total_rows: i64,
    /// Cells whose mapping changed at least once.
    pub cells_with_history: i64,
    pub distinct_offices: i64,
}

type VersionRow = (i64, i64, String, i64, i64, String, Option<String>, bool);

const VERSION_COLUMNS: &str =
    "version_id, cell_id, office_code, grid_x, grid_y, effective_from, effective_to, is_current";

fn version_from_row(row: VersionRow) -> StorageResult<GridpointVersion> {
    let (version_id, cell_id, office, x, y, from, to, is_current) = row;
    let gridpoint = GridpointId::from_raw(&office, x, y)
        .map_err(|e| StorageError::InvalidRow(format!("version {version_id}: {e}")))?;
    Ok(GridpointVersion {
        version_id,
        cell_id: CellId(cell_id),
        gridpoint,
        effective_from: decode_ts(&from)?,
        effective_to: to.as_deref().map(decode_ts).transpose()?,
        is_current,
    })
}

/// Handle for version reads and commits.
#[derive(Debug, Clone)]
pub struct VersionStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl VersionStore {
    pub(crate) fn new(pool: SqlitePool, writer: Arc<Mutex<()>>) -> Self {
        Self { pool, writer }
    }

    /// The open version of a cell, if it was ever resolved.
    pub async fn current(&self, cell_id: CellId) -> StorageResult<Option<GridpointVersion>> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM gridpoint_versions WHERE cell_id = ? AND is_current = 1"
        ))
        .bind(cell_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(version_from_row).transpose()
    }

    /// Every version of a cell, oldest first.
    pub async fn history(&self, cell_id: CellId) -> StorageResult<Vec<GridpointVersion>> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM gridpoint_versions WHERE cell_id = ? ORDER BY effective_from ASC"
        ))
        .bind(cell_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(version_from_row).collect()
    }

    /// The version in effect at `at`.
    pub async fn as_of(
        &self,
        cell_id: CellId,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<GridpointVersion>> {
        let at = encode_ts(storable(at));
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {VERSION_COLUMNS} FROM gridpoint_versions
            WHERE cell_id = ?
              AND effective_from <= ?
              AND (effective_to IS NULL OR effective_to > ?)
            "#
        ))
        .bind(cell_id.0)
        .bind(&at)
        .bind(&at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(version_from_row).transpose()
    }

    /// Record that `cell_id` maps to `gridpoint` as of `at`.
    ///
    /// Idempotent: committing the current gridpoint again writes nothing. A
    /// changed gridpoint must be committed strictly after the current row's
    /// `effective_from`.
    pub async fn commit(
        &self,
        cell_id: CellId,
        gridpoint: &GridpointId,
        at: DateTime<Utc>,
    ) -> StorageResult<CommitOutcome> {
        self.commit_inner(cell_id, gridpoint, None, at).await
    }

    /// `commit`, plus the cell's metadata in the same transaction.
    ///
    /// Metadata is replaced only when it differs from the stored copy, so an
    /// unchanged answer still writes nothing.
    pub async fn commit_resolution(
        &self,
        cell_id: CellId,
        gridpoint: &GridpointId,
        metadata: &PointMetadata,
        at: DateTime<Utc>,
    ) -> StorageResult<CommitOutcome> {
        self.commit_inner(cell_id, gridpoint, Some(metadata), at)
            .await
    }

    /// Latest metadata stored for a cell.
    pub async fn metadata(&self, cell_id: CellId) -> StorageResult<Option<PointMetadata>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT metadata FROM cell_metadata WHERE cell_id = ?")
                .bind(cell_id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(text,)| serde_json::from_str(&text).map_err(StorageError::from))
            .transpose()
    }

    async fn commit_inner(
        &self,
        cell_id: CellId,
        gridpoint: &GridpointId,
        metadata: Option<&PointMetadata>,
        at: DateTime<Utc>,
    ) -> StorageResult<CommitOutcome> {
        let at = storable(at);
        let _write = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let current: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM gridpoint_versions WHERE cell_id = ? AND is_current = 1"
        ))
        .bind(cell_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match current.map(version_from_row).transpose()? {
            None => {
                let inserted = insert_open(&mut tx, cell_id, gridpoint, at).await?;
                CommitOutcome::Inserted(inserted)
            }
            Some(existing) if existing.gridpoint == *gridpoint => {
                if let Some(metadata) = metadata {
                    upsert_metadata(&mut tx, cell_id, metadata, at).await?;
                    tx.commit().await?;
                }
                return Ok(CommitOutcome::Unchanged(existing));
            }
            Some(existing) => {
                if at <= existing.effective_from {
                    return Err(StorageError::NonMonotonicCommit {
                        cell_id,
                        at,
                        effective_from: existing.effective_from,
                    });
                }

                sqlx::query(
                    "UPDATE gridpoint_versions SET effective_to = ?, is_current = 0 WHERE version_id = ?",
                )
                .bind(encode_ts(at))
                .bind(existing.version_id)
                .execute(&mut *tx)
                .await?;

                let current = insert_open(&mut tx, cell_id, gridpoint, at).await?;
                CommitOutcome::Superseded {
                    previous: GridpointVersion {
                        effective_to: Some(at),
                        is_current: false,
                        ..existing
                    },
                    current,
                }
            }
        };

        if let Some(metadata) = metadata {
            upsert_metadata(&mut tx, cell_id, metadata, at).await?;
        }
        tx.commit().await?;

        debug!(
            cell_id = cell_id.0,
            gridpoint = %gridpoint,
            changed = outcome.is_change(),
            "Committed gridpoint"
        );
        Ok(outcome)
    }

    pub async fn current_count(&self) -> StorageResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM gridpoint_versions WHERE is_current = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn stats(&self) -> StorageResult<VersionStats> {
        let (current_rows, total_rows, distinct_offices): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(is_current), 0),
                   COUNT(*),
                   COUNT(DISTINCT CASE WHEN is_current = 1 THEN office_code END)
            FROM gridpoint_versions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let (cells_with_history,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM (
                SELECT cell_id FROM gridpoint_versions GROUP BY cell_id HAVING COUNT(*) > 1
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(VersionStats {
            current_rows,
            total_rows,
            cells_with_history,
            distinct_offices,
        })
    }
}

async fn insert_open(
    tx: &mut Transaction<'_, Sqlite>,
    cell_id: CellId,
    gridpoint: &GridpointId,
    at: DateTime<Utc>,
) -> StorageResult<GridpointVersion> {
    let version_id = sqlx::query(
        r#"
        INSERT INTO gridpoint_versions
            (cell_id, office_code, grid_x, grid_y, effective_from, effective_to, is_current)
        VALUES (?, ?, ?, ?, ?, NULL, 1)
        "#,
    )
    .bind(cell_id.0)
    .bind(gridpoint.office_code())
    .bind(i64::from(gridpoint.grid_x()))
    .bind(i64::from(gridpoint.grid_y()))
    .bind(encode_ts(at))
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    Ok(GridpointVersion {
        version_id,
        cell_id,
        gridpoint: gridpoint.clone(),
        effective_from: at,
        effective_to: None,
        is_current: true,
    })
}

async fn upsert_metadata(
    tx: &mut Transaction<'_, Sqlite>,
    cell_id: CellId,
    metadata: &PointMetadata,
    at: DateTime<Utc>,
) -> StorageResult<()> {
    let text = serde_json::to_string(metadata)?;
    sqlx::query(
        r#"
        INSERT INTO cell_metadata (cell_id, metadata, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(cell_id) DO UPDATE
            SET metadata = excluded.metadata, updated_at = excluded.updated_at
            WHERE cell_metadata.metadata IS NOT excluded.metadata
        "#,
    )
    .bind(cell_id.0)
    .bind(text)
    .bind(encode_ts(at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GridpointStore;
    use chrono::TimeZone;
    use gridpoint_common::{GeoPoint, RasterCell};

    async fn store_with_cells(n: i64) -> GridpointStore {
        let store = GridpointStore::open_memory().await.unwrap();
        store
            .catalog()
            .register_partition(
                2500.0,
                (0..n).map(|c| (RasterCell::new(0, c), GeoPoint::new(39.7451, -97.0799))),
            )
            .await
            .unwrap();
        store
    }

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn gp(s: &str) -> GridpointId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_first_commit_inserts_open_row() {
        let store = store_with_cells(1).await;
        let versions = store.versions();

        let outcome = versions.commit(CellId(1), &gp("TOP/32,81"), t(0)).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Inserted(_)));

        let current = versions.current(CellId(1)).await.unwrap().unwrap();
        assert_eq!(current.gridpoint, gp("TOP/32,81"));
        assert_eq!(current.effective_from, t(0));
        assert_eq!(current.effective_to, None);
        assert!(current.is_current);
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let store = store_with_cells(1).await;
        let versions = store.versions();

        versions.commit(CellId(1), &gp("TOP/32,81"), t(0)).await.unwrap();
        let again = versions.commit(CellId(1), &gp("TOP/32,81"), t(6)).await.unwrap();
        // Same timestamp as the open row is still a no-op for an equal gridpoint
        let same_time = versions.commit(CellId(1), &gp("TOP/32,81"), t(0)).await.unwrap();

        assert!(!again.is_change());
        assert!(!same_time.is_change());
        assert_eq!(versions.history(CellId(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_commit_supersedes() {
        let store = store_with_cells(1).await;
        let versions = store.versions();

        versions.commit(CellId(1), &gp("TOP/32,81"), t(0)).await.unwrap();
        let outcome = versions.commit(CellId(1), &gp("TOP/32,82"), t(6)).await.unwrap();

        match outcome {
            CommitOutcome::Superseded { previous, current } => {
                assert_eq!(previous.effective_to, Some(t(6)));
                assert!(!previous.is_current);
                assert_eq!(current.effective_from, t(6));
            }
            other => panic!("expected supersede, got {other:?}"),
        }

        let history = versions.history(CellId(1)).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].effective_to, Some(history[1].effective_from));
        assert_eq!(history.iter().filter(|v| v.is_current).count(), 1);
    }

    #[tokio::test]
    async fn test_non_monotonic_change_is_rejected() {
        let store = store_with_cells(1).await;
        let versions = store.versions();

        versions.commit(CellId(1), &gp("TOP/32,81"), t(6)).await.unwrap();
        let err = versions
            .commit(CellId(1), &gp("TOP/32,82"), t(6))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NonMonotonicCommit { .. }));

        let err = versions
            .commit(CellId(1), &gp("TOP/32,82"), t(3))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NonMonotonicCommit { .. }));

        // Nothing changed
        let history = versions.history(CellId(1)).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_current);
    }

    #[tokio::test]
    async fn test_as_of_picks_interval() {
        let store = store_with_cells(1).await;
        let versions = store.versions();

        versions.commit(CellId(1), &gp("TOP/32,81"), t(0)).await.unwrap();
        versions.commit(CellId(1), &gp("TOP/32,82"), t(6)).await.unwrap();
        versions.commit(CellId(1), &gp("TOP/33,82"), t(12)).await.unwrap();

        let at = |h| versions.as_of(CellId(1), t(h));
        assert_eq!(at(0).await.unwrap().unwrap().gridpoint, gp("TOP/32,81"));
        assert_eq!(at(5).await.unwrap().unwrap().gridpoint, gp("TOP/32,81"));
        assert_eq!(at(6).await.unwrap().unwrap().gridpoint, gp("TOP/32,82"));
        assert_eq!(at(23).await.unwrap().unwrap().gridpoint, gp("TOP/33,82"));

        let before = versions
            .as_of(CellId(1), t(0) - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(before.is_none());
    }

    #[tokio::test]
    async fn test_commit_unknown_cell_fails() {
        let store = store_with_cells(1).await;
        let err = store
            .versions()
            .commit(CellId(42), &gp("TOP/32,81"), t(0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Database(_)));
    }

    #[tokio::test]
    async fn test_stats() {
        let store = store_with_cells(3).await;
        let versions = store.versions();

        versions.commit(CellId(1), &gp("TOP/32,81"), t(0)).await.unwrap();
        versions.commit(CellId(2), &gp("TOP/33,81"), t(0)).await.unwrap();
        versions.commit(CellId(3), &gp("GID/1,1"), t(0)).await.unwrap();
        versions.commit(CellId(1), &gp("TOP/32,82"), t(6)).await.unwrap();

        let stats = versions.stats().await.unwrap();
        assert_eq!(
            stats,
            VersionStats {
                current_rows: 3,
                total_rows: 4,
                cells_with_history: 1,
                distinct_offices: 2,
            }
        );
        assert_eq!(versions.current_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_commit_resolution_keeps_latest_metadata() {
        let store = store_with_cells(1).await;
        let versions = store.versions();
        assert_eq!(versions.metadata(CellId(1)).await.unwrap(), None);

        let first = PointMetadata {
            forecast_office_url: Some("https://api.weather.gov/offices/TOP".into()),
            forecast_zone_url: Some("https://api.weather.gov/zones/forecast/KSZ024".into()),
            time_zone: Some("America/Chicago".into()),
            ..PointMetadata::default()
        };
        versions
            .commit_resolution(CellId(1), &gp("TOP/32,81"), &first, t(0))
            .await
            .unwrap();
        assert_eq!(versions.metadata(CellId(1)).await.unwrap(), Some(first.clone()));

        // Same gridpoint, new radar: no new version, metadata replaced
        let second = PointMetadata {
            radar_station: Some("KTWX".into()),
            ..first
        };
        let outcome = versions
            .commit_resolution(CellId(1), &gp("TOP/32,81"), &second, t(6))
            .await
            .unwrap();
        assert!(!outcome.is_change());
        assert_eq!(versions.history(CellId(1)).await.unwrap().len(), 1);
        assert_eq!(versions.metadata(CellId(1)).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_rejected_commit_leaves_metadata_untouched() {
        let store = store_with_cells(1).await;
        let versions = store.versions();

        versions.commit(CellId(1), &gp("TOP/32,81"), t(6)).await.unwrap();
        let metadata = PointMetadata {
            time_zone: Some("America/Chicago".into()),
            ..PointMetadata::default()
        };
        let err = versions
            .commit_resolution(CellId(1), &gp("TOP/32,82"), &metadata, t(3))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NonMonotonicCommit { .. }));
        assert_eq!(versions.metadata(CellId(1)).await.unwrap(), None);
    }
}
