//! Read path: coordinate to current gridpoint.
//!
//! Lookups go through the live spatial index and the version store only.
//! The remote authority is consulted solely through `resolve_on_demand`,
//! which callers must ask for explicitly and which never writes.
//!
//! `IndexReloader` keeps the live index in step with the catalog: when a
//! newer partition is registered it builds a fresh index and swaps it in.

use std::sync::Arc;
use std::time::Duration;

use gridpoint_common::{CellId, GeoPoint, GridpointError, PointMetadata};
use partition::{IndexHandle, PartitionError, SpatialIndex, DEFAULT_EDGE_M};
use projection::AlbersEqualArea;
use storage::{CellCatalog, GridpointVersion, StorageError, VersionStore};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::resolver::{PointResolution, ResolutionClient, ResolveError};
use crate::throttle::Throttle;

/// Result of a table lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Resolved {
        cell_id: CellId,
        version: GridpointVersion,
        /// Latest descriptive fields stored by a refresh, if any.
        metadata: Option<PointMetadata>,
    },
    /// The coordinate is outside every cell.
    NotCovered,
    /// The cell exists but no refresh has resolved it yet.
    NotYetResolved { cell_id: CellId },
}

impl LookupOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            LookupOutcome::Resolved { .. } => "resolved",
            LookupOutcome::NotCovered => "not_covered",
            LookupOutcome::NotYetResolved { .. } => "not_yet_resolved",
        }
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Invalid coordinate: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("On-demand resolution is disabled")]
    FallbackDisabled,

    #[error("On-demand resolution failed: {0}")]
    Resolve(#[from] ResolveError),
}

impl From<LookupError> for GridpointError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::InvalidCoordinate { lat, lon } => {
                GridpointError::InvalidCoordinate { lat, lon }
            }
            LookupError::Storage(e) => e.into(),
            LookupError::FallbackDisabled => {
                GridpointError::ServiceUnavailable("on-demand resolution is disabled".into())
            }
            LookupError::Resolve(e) => GridpointError::ResolutionError(e.to_string()),
        }
    }
}

/// Remote client plus the throttle reserved for on-demand calls.
pub struct Fallback {
    pub client: Arc<ResolutionClient>,
    pub throttle: Throttle,
}

pub struct LookupService {
    index: Arc<IndexHandle>,
    versions: VersionStore,
    fallback: Option<Fallback>,
}

impl LookupService {
    pub fn new(index: Arc<IndexHandle>, versions: VersionStore, fallback: Option<Fallback>) -> Self {
        Self {
            index,
            versions,
            fallback,
        }
    }

    pub fn index(&self) -> &Arc<IndexHandle> {
        &self.index
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback.is_some()
    }

    /// Current gridpoint for a coordinate, from the local table.
    pub async fn forecast_gridpoint_for(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<LookupOutcome, LookupError> {
        let point = checked(lat, lon)?;

        let outcome = match self.index.load().locate(point.lat, point.lon) {
            None => LookupOutcome::NotCovered,
            Some(cell_id) => match self.versions.current(cell_id).await? {
                Some(version) => LookupOutcome::Resolved {
                    cell_id,
                    version,
                    metadata: self.versions.metadata(cell_id).await?,
                },
                None => LookupOutcome::NotYetResolved { cell_id },
            },
        };

        debug!(lat = lat, lon = lon, outcome = outcome.label(), "Lookup");
        metrics::record_lookup(outcome.label());
        Ok(outcome)
    }

    /// Ask the authority directly. Nothing is persisted.
    pub async fn resolve_on_demand(
        &self,
        lat: f64,
        lon: f64,
    ) -> Result<PointResolution, LookupError> {
        let point = checked(lat, lon)?;
        let fallback = self.fallback.as_ref().ok_or(LookupError::FallbackDisabled)?;

        let result = fallback.client.resolve(point, &fallback.throttle).await;
        metrics::record_lookup(if result.is_ok() {
            "fallback_resolved"
        } else {
            "fallback_failed"
        });
        Ok(result?)
    }
}

fn checked(lat: f64, lon: f64) -> Result<GeoPoint, LookupError> {
    GeoPoint::checked(lat, lon).map_err(|_| LookupError::InvalidCoordinate { lat, lon })
}

// ============================================================================
// Index reloading
// ============================================================================

#[derive(Debug, Error)]
pub enum IndexLoadError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Partition(#[from] PartitionError),
}

/// Tracks which partition the live index was built from.
pub struct IndexReloader {
    catalog: CellCatalog,
    projection: AlbersEqualArea,
    index: Arc<IndexHandle>,
    loaded_partition: Option<i64>,
}

impl IndexReloader {
    /// Build the index for the latest partition (empty when none exists).
    pub async fn load(
        catalog: CellCatalog,
        projection: AlbersEqualArea,
    ) -> Result<Self, IndexLoadError> {
        let (partition_id, index) = build_index(&catalog, &projection).await?;
        if partition_id.is_none() {
            warn!("No partition registered; lookups will not cover anything");
        }
        Ok(Self {
            catalog,
            projection,
            index: Arc::new(IndexHandle::new(index)),
            loaded_partition: partition_id,
        })
    }

    /// The handle lookups read from.
    pub fn handle(&self) -> Arc<IndexHandle> {
        Arc::clone(&self.index)
    }

    pub fn loaded_partition(&self) -> Option<i64> {
        self.loaded_partition
    }

    /// Swap in a fresh index if a newer partition was registered.
    ///
    /// Returns whether a swap happened.
    pub async fn reload_if_changed(&mut self) -> Result<bool, IndexLoadError> {
        let latest = self
            .catalog
            .latest_partition()
            .await?
            .map(|p| p.partition_id);
        if latest == self.loaded_partition {
            return Ok(false);
        }

        let (partition_id, index) = build_index(&self.catalog, &self.projection).await?;
        info!(
            previous_partition = ?self.loaded_partition,
            partition_id = ?partition_id,
            cells = index.len(),
            "Reloading spatial index"
        );
        self.index.swap(index);
        self.loaded_partition = partition_id;
        Ok(true)
    }

    /// Poll the catalog every `every` until cancelled.
    pub async fn watch(mut self, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.reload_if_changed().await {
                error!(error = %e, "Index reload failed; keeping the current index");
            }
        }
    }
}

async fn build_index(
    catalog: &CellCatalog,
    projection: &AlbersEqualArea,
) -> Result<(Option<i64>, SpatialIndex), IndexLoadError> {
    let Some(record) = catalog.latest_partition().await? else {
        metrics::set_index_cells(0);
        return Ok((None, SpatialIndex::empty(projection.clone(), DEFAULT_EDGE_M)));
    };
    let cells = catalog.active_cells().await?;
    let index = SpatialIndex::from_cells(projection.clone(), record.edge_m, &cells)?;
    metrics::set_index_cells(index.len());
    Ok((Some(record.partition_id), index))
}
