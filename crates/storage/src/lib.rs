//! Persistence for the gridpoint engine.
//!
//! One SQLite database (WAL mode) holds:
//! - the cell catalog: every cell ever minted, with retirement marks
//! - the SCD2 version table: which gridpoint each cell mapped to, and when
//! - the refresh run log, including per-cell failures
//!
//! `GridpointStore` owns the pool; `CellCatalog`, `VersionStore` and `RunLog`
//! are cheap handles onto it for each concern.

pub mod catalog;
pub mod error;
pub mod runs;
pub mod store;
pub mod versions;

pub use catalog::{CatalogCell, CellCatalog, CellCounts, PartitionRecord, PartitionSummary};
pub use error::{StorageError, StorageResult};
pub use runs::{RefreshRun, RunFailure, RunLog, RunStatus, RunTotals};
pub use store::GridpointStore;
pub use versions::{CommitOutcome, GridpointVersion, VersionStats, VersionStore};
