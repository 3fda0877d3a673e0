//! Database handle and schema.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::info;

use crate::catalog::CellCatalog;
use crate::error::{StorageError, StorageResult};
use crate::runs::RunLog;
use crate::versions::VersionStore;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS partitions (
    partition_id INTEGER PRIMARY KEY AUTOINCREMENT,
    edge_m REAL NOT NULL,
    cell_count INTEGER NOT NULL,
    cells_added INTEGER NOT NULL,
    cells_retired INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cells (
    cell_id INTEGER PRIMARY KEY,
    raster_row INTEGER NOT NULL,
    raster_col INTEGER NOT NULL,
    centroid_lat REAL NOT NULL,
    centroid_lon REAL NOT NULL,
    partition_id INTEGER NOT NULL REFERENCES partitions(partition_id),
    retired_at TEXT,
    UNIQUE (raster_row, raster_col)
);

CREATE INDEX IF NOT EXISTS idx_cells_retired ON cells(retired_at);

CREATE TABLE IF NOT EXISTS gridpoint_versions (
    version_id INTEGER PRIMARY KEY AUTOINCREMENT,
    cell_id INTEGER NOT NULL REFERENCES cells(cell_id),
    office_code TEXT NOT NULL,
    grid_x INTEGER NOT NULL CHECK (grid_x >= 0),
    grid_y INTEGER NOT NULL CHECK (grid_y >= 0),
    effective_from TEXT NOT NULL,
    effective_to TEXT,
    is_current INTEGER NOT NULL DEFAULT 1,
    CHECK (effective_to IS NULL OR effective_to > effective_from),
    CHECK ((is_current = 1) = (effective_to IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_one_current
    ON gridpoint_versions(cell_id) WHERE is_current = 1;

CREATE INDEX IF NOT EXISTS idx_versions_cell_from
    ON gridpoint_versions(cell_id, effective_from);

CREATE TABLE IF NOT EXISTS cell_metadata (
    cell_id INTEGER PRIMARY KEY REFERENCES cells(cell_id),
    metadata TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS refresh_runs (
    run_id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_run_id INTEGER REFERENCES refresh_runs(run_id),
    started_at TEXT NOT NULL,
    completed_at TEXT,
    cells_attempted INTEGER NOT NULL DEFAULT 0,
    cells_changed INTEGER NOT NULL DEFAULT 0,
    cells_failed INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'running'
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON refresh_runs(status);

CREATE TABLE IF NOT EXISTS refresh_run_failures (
    run_id INTEGER NOT NULL REFERENCES refresh_runs(run_id),
    cell_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    PRIMARY KEY (run_id, cell_id)
)
"#;

/// Handle to the gridpoint database.
///
/// Clones share the pool and the writer gate. SQLite admits one writer at a
/// time; the gate serializes this process's write transactions so a
/// read-then-write transaction never loses its snapshot to a sibling writer.
#[derive(Debug, Clone)]
pub struct GridpointStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl GridpointStore {
    /// Open or create the database at the given path.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;

        info!(path = %path.display(), "Opened gridpoint database");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .foreign_keys(true);

        // A single connection that never expires: the database lives and
        // dies with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    async fn migrate(&self) -> StorageResult<()> {
        for statement in SCHEMA_SQL.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    pub fn catalog(&self) -> CellCatalog {
        CellCatalog::new(self.pool.clone(), Arc::clone(&self.writer))
    }

    pub fn versions(&self) -> VersionStore {
        VersionStore::new(self.pool.clone(), Arc::clone(&self.writer))
    }

    pub fn runs(&self) -> RunLog {
        RunLog::new(self.pool.clone(), Arc::clone(&self.writer))
    }

    /// Round-trip check used by health endpoints.
    pub async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ============================================================================
// Timestamp encoding
// ============================================================================

/// Timestamps are stored as fixed-width RFC3339 UTC text with microseconds,
/// so lexical order equals chronological order.
pub(crate) fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(text: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidRow(format!("bad timestamp {text:?}: {e}")))
}

/// Drop sub-microsecond precision so a value survives a storage round trip.
pub(crate) fn storable(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}
