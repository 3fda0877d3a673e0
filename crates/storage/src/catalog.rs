//! Cell catalog: the persisted partition.
//!
//! A cell id is minted once per raster square and never reused. Registering
//! a new partition keeps the ids of squares already known, mints ids above
//! the current maximum for new squares, and retires squares that dropped
//! out. Retired cells keep their rows (and their version history).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gridpoint_common::{Cell, CellId, GeoPoint, RasterCell};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::store::{decode_ts, encode_ts};

/// Rows per multi-row statement; keeps bind counts under SQLite's limit.
const CHUNK: usize = 4000;

/// Edge lengths closer than this are the same raster.
const EDGE_TOLERANCE_M: f64 = 1e-6;

/// A stored partition record.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionRecord {
    pub partition_id: i64,
    pub edge_m: f64,
    pub cell_count: i64,
    pub created_at: DateTime<Utc>,
}

/// What a `register_partition` call changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionSummary {
    pub partition_id: i64,
    pub edge_m: f64,
    pub cells_total: usize,
    pub cells_added: usize,
    pub cells_kept: usize,
    pub cells_reactivated: usize,
    pub cells_retired: usize,
}

/// A cell as stored, active or retired.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogCell {
    pub cell: Cell,
    pub retired_at: Option<DateTime<Utc>>,
}

impl CatalogCell {
    pub fn is_active(&self) -> bool {
        self.retired_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CellCounts {
    pub active: i64,
    pub retired: i64,
}

type CellRow = (i64, i64, i64, f64, f64, Option<String>);

const CELL_COLUMNS: &str =
    "cell_id, raster_row, raster_col, centroid_lat, centroid_lon, retired_at";

fn cell_from_row(row: CellRow) -> StorageResult<CatalogCell> {
    let (id, r, c, lat, lon, retired_at) = row;
    Ok(CatalogCell {
        cell: Cell {
            id: CellId(id),
            raster: RasterCell::new(r, c),
            centroid: GeoPoint::new(lat, lon),
        },
        retired_at: retired_at.as_deref().map(decode_ts).transpose()?,
    })
}

/// Handle for cell catalog operations.
#[derive(Debug, Clone)]
pub struct CellCatalog {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl CellCatalog {
    pub(crate) fn new(pool: SqlitePool, writer: Arc<Mutex<()>>) -> Self {
        Self { pool, writer }
    }

    /// Persist a partition, reconciling it against the cells already known.
    ///
    /// `squares` is the partition's output in row-major order. All changes
    /// happen in one transaction.
    pub async fn register_partition<I>(
        &self,
        edge_m: f64,
        squares: I,
    ) -> StorageResult<PartitionSummary>
    where
        I: IntoIterator<Item = (RasterCell, GeoPoint)>,
    {
        let _write = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let now = encode_ts(Utc::now());

        let latest: Option<(f64,)> = sqlx::query_as(
            "SELECT edge_m FROM partitions ORDER BY partition_id DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((existing,)) = latest {
            if (existing - edge_m).abs() > EDGE_TOLERANCE_M {
                return Err(StorageError::EdgeMismatch {
                    existing,
                    requested: edge_m,
                });
            }
        }

        let known: Vec<(i64, i64, i64, bool)> = sqlx::query_as(
            "SELECT cell_id, raster_row, raster_col, retired_at IS NOT NULL FROM cells",
        )
        .fetch_all(&mut *tx)
        .await?;
        let mut next_id = known.iter().map(|k| k.0).max().unwrap_or(0) + 1;
        let known: HashMap<RasterCell, (i64, bool)> = known
            .into_iter()
            .map(|(id, r, c, retired)| (RasterCell::new(r, c), (id, retired)))
            .collect();

        let mut seen: HashSet<RasterCell> = HashSet::new();
        let mut added: Vec<(i64, RasterCell, GeoPoint)> = Vec::new();
        let mut reactivated: Vec<i64> = Vec::new();
        let mut kept = 0usize;

        for (raster, centroid) in squares {
            if !seen.insert(raster) {
                return Err(StorageError::DuplicateSquare {
                    row: raster.row,
                    col: raster.col,
                });
            }
            match known.get(&raster) {
                Some(&(id, true)) => reactivated.push(id),
                Some(&(_, false)) => kept += 1,
                None => {
                    added.push((next_id, raster, centroid));
                    next_id += 1;
                }
            }
        }

        let retired: Vec<i64> = known
            .iter()
            .filter(|&(raster, &(_, is_retired))| !is_retired && !seen.contains(raster))
            .map(|(_, &(id, _))| id)
            .collect();

        let partition_id = sqlx::query(
            r#"
            INSERT INTO partitions (edge_m, cell_count, cells_added, cells_retired, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(edge_m)
        .bind(seen.len() as i64)
        .bind(added.len() as i64)
        .bind(retired.len() as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for chunk in added.chunks(CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO cells (cell_id, raster_row, raster_col, centroid_lat, centroid_lon, partition_id) ",
            );
            qb.push_values(chunk, |mut b, (id, raster, centroid)| {
                b.push_bind(*id)
                    .push_bind(raster.row)
                    .push_bind(raster.col)
                    .push_bind(centroid.lat)
                    .push_bind(centroid.lon)
                    .push_bind(partition_id);
            });
            qb.build().execute(&mut *tx).await?;
        }

        for chunk in reactivated.chunks(CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE cells SET retired_at = NULL WHERE cell_id IN (");
            push_id_list(&mut qb, chunk);
            qb.build().execute(&mut *tx).await?;
        }

        for chunk in retired.chunks(CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE cells SET retired_at = ");
            qb.push_bind(now.clone());
            qb.push(" WHERE cell_id IN (");
            push_id_list(&mut qb, chunk);
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        let summary = PartitionSummary {
            partition_id,
            edge_m,
            cells_total: seen.len(),
            cells_added: added.len(),
            cells_kept: kept,
            cells_reactivated: reactivated.len(),
            cells_retired: retired.len(),
        };

        info!(
            partition_id = partition_id,
            cells = summary.cells_total,
            added = summary.cells_added,
            kept = summary.cells_kept,
            reactivated = summary.cells_reactivated,
            retired = summary.cells_retired,
            "Registered partition"
        );

        Ok(summary)
    }

    /// All active cells, ordered by id.
    pub async fn active_cells(&self) -> StorageResult<Vec<Cell>> {
        let rows: Vec<CellRow> = sqlx::query_as(&format!(
            "SELECT {CELL_COLUMNS} FROM cells WHERE retired_at IS NULL ORDER BY cell_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        let cells = rows
            .into_iter()
            .map(|row| cell_from_row(row).map(|c| c.cell))
            .collect::<StorageResult<Vec<_>>>()?;

        debug!(cells = cells.len(), "Loaded active cells");
        Ok(cells)
    }

    /// The active cells among `ids`, ordered by id. Unknown and retired ids
    /// are skipped.
    pub async fn active_cells_by_id(&self, ids: &[CellId]) -> StorageResult<Vec<Cell>> {
        let mut cells = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT {CELL_COLUMNS} FROM cells WHERE retired_at IS NULL AND cell_id IN ("
            ));
            let raw: Vec<i64> = chunk.iter().map(|id| id.0).collect();
            push_id_list(&mut qb, &raw);
            let rows: Vec<CellRow> = qb.build_query_as().fetch_all(&self.pool).await?;
            for row in rows {
                cells.push(cell_from_row(row)?.cell);
            }
        }
        cells.sort_by_key(|c| c.id);
        Ok(cells)
    }

    /// A single cell, active or retired.
    pub async fn cell(&self, id: CellId) -> StorageResult<Option<CatalogCell>> {
        let row: Option<CellRow> =
            sqlx::query_as(&format!("SELECT {CELL_COLUMNS} FROM cells WHERE cell_id = ?"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(cell_from_row).transpose()
    }

    pub async fn latest_partition(&self) -> StorageResult<Option<PartitionRecord>> {
        let row: Option<(i64, f64, i64, String)> = sqlx::query_as(
            r#"
            SELECT partition_id, edge_m, cell_count, created_at
            FROM partitions
            ORDER BY partition_id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(partition_id, edge_m, cell_count, created_at)| {
            Ok(PartitionRecord {
                partition_id,
                edge_m,
                cell_count,
                created_at: decode_ts(&created_at)?,
            })
        })
        .transpose()
    }

    pub async fn counts(&self) -> StorageResult<CellCounts> {
        let (active, retired): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(retired_at IS NULL), 0), COALESCE(SUM(retired_at IS NOT NULL), 0)
            FROM cells
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(CellCounts { active, retired })
    }
}

fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}
