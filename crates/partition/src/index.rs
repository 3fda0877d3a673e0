//! Constant-time coordinate to cell lookup.
//!
//! Cells come from a uniform raster in the projected frame, so a query is
//! projected, floor-divided by the edge length, and looked up in a map keyed
//! by `(row, col)`. The index is immutable once built. `IndexHandle` swaps in
//! a whole new index after a re-partition; readers holding the old `Arc`
//! finish against the snapshot they started with.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use gridpoint_common::{Cell, CellId, RasterCell};
use projection::AlbersEqualArea;
use tracing::info;

use crate::error::{PartitionError, PartitionResult};

/// Immutable spatial index over one partition.
#[derive(Debug)]
pub struct SpatialIndex {
    projection: AlbersEqualArea,
    edge_m: f64,
    cells: HashMap<RasterCell, CellId>,
    /// Inclusive (min, max) row/col extent, used to reject far-away queries
    /// before hashing.
    extent: Option<(RasterCell, RasterCell)>,
}

impl SpatialIndex {
    /// Build an index from `(raster, cell_id)` pairs.
    ///
    /// Two cells on the same raster square are rejected.
    pub fn build<I>(projection: AlbersEqualArea, edge_m: f64, cells: I) -> PartitionResult<Self>
    where
        I: IntoIterator<Item = (RasterCell, CellId)>,
    {
        if !(edge_m.is_finite() && edge_m > 0.0) {
            return Err(PartitionError::InvalidEdgeLength(edge_m));
        }

        let iter = cells.into_iter();
        let mut map = HashMap::with_capacity(iter.size_hint().0);
        let mut extent: Option<(RasterCell, RasterCell)> = None;

        for (raster, id) in iter {
            if map.insert(raster, id).is_some() {
                return Err(PartitionError::DuplicateCell {
                    row: raster.row,
                    col: raster.col,
                });
            }
            extent = Some(match extent {
                None => (raster, raster),
                Some((lo, hi)) => (
                    RasterCell::new(lo.row.min(raster.row), lo.col.min(raster.col)),
                    RasterCell::new(hi.row.max(raster.row), hi.col.max(raster.col)),
                ),
            });
        }

        info!(cells = map.len(), edge_m = edge_m, "Built spatial index");

        Ok(Self {
            projection,
            edge_m,
            cells: map,
            extent,
        })
    }

    /// Build an index from minted cells.
    pub fn from_cells<'a, I>(
        projection: AlbersEqualArea,
        edge_m: f64,
        cells: I,
    ) -> PartitionResult<Self>
    where
        I: IntoIterator<Item = &'a Cell>,
    {
        Self::build(projection, edge_m, cells.into_iter().map(|c| (c.raster, c.id)))
    }

    /// An index that covers nothing.
    pub fn empty(projection: AlbersEqualArea, edge_m: f64) -> Self {
        Self {
            projection,
            edge_m,
            cells: HashMap::new(),
            extent: None,
        }
    }

    /// The raster square a coordinate falls in, whether or not it is covered.
    pub fn raster_of(&self, lat: f64, lon: f64) -> Option<RasterCell> {
        if !(lat.is_finite() && lon.is_finite()) || lat.abs() > 90.0 || lon.abs() > 180.0 {
            return None;
        }
        let (x, y) = self.projection.forward(lat, lon);
        if !(x.is_finite() && y.is_finite()) {
            return None;
        }
        Some(RasterCell::containing(x, y, self.edge_m))
    }

    /// Cell containing the coordinate, or `None` when it is not covered.
    pub fn locate(&self, lat: f64, lon: f64) -> Option<CellId> {
        let raster = self.raster_of(lat, lon)?;
        let (lo, hi) = self.extent?;
        if raster.row < lo.row || raster.row > hi.row || raster.col < lo.col || raster.col > hi.col
        {
            return None;
        }
        self.cells.get(&raster).copied()
    }

    pub fn edge_m(&self) -> f64 {
        self.edge_m
    }

    pub fn projection(&self) -> &AlbersEqualArea {
        &self.projection
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Shared, atomically replaceable reference to the live index.
#[derive(Debug)]
pub struct IndexHandle {
    current: RwLock<Arc<SpatialIndex>>,
}

impl IndexHandle {
    pub fn new(index: SpatialIndex) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
        }
    }

    /// Snapshot of the live index. The lock is held only to clone the `Arc`.
    pub fn load(&self) -> Arc<SpatialIndex> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the live index, returning the previous one.
    pub fn swap(&self, index: SpatialIndex) -> Arc<SpatialIndex> {
        let next = Arc::new(index);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let previous = std::mem::replace(&mut *guard, next);
        info!(
            previous_cells = previous.len(),
            cells = guard.len(),
            "Swapped spatial index"
        );
        previous
    }
}
