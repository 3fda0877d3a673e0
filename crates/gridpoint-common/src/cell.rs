//! Partition cells and coordinates.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GridpointError, GridpointResult};
use crate::BoundingBox;

/// Stable cell identifier. Minted once, never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub i64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A geodetic coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Build a point, rejecting non-finite or out-of-range values.
    pub fn checked(lat: f64, lon: f64) -> GridpointResult<Self> {
        let point = Self { lat, lon };
        if point.is_valid() {
            Ok(point)
        } else {
            Err(GridpointError::InvalidCoordinate { lat, lon })
        }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Absolute position of a square in the projected raster.
///
/// Indices are anchored at the projection origin, so `col = floor(x / edge)`
/// and `row = floor(y / edge)` mean the same square across re-partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RasterCell {
    pub row: i64,
    pub col: i64,
}

impl RasterCell {
    pub fn new(row: i64, col: i64) -> Self {
        Self { row, col }
    }

    /// The raster square containing projected point `(x, y)`.
    pub fn containing(x: f64, y: f64, edge_m: f64) -> Self {
        Self {
            row: (y / edge_m).floor() as i64,
            col: (x / edge_m).floor() as i64,
        }
    }

    /// Projected extent of the square.
    pub fn bounds(&self, edge_m: f64) -> BoundingBox {
        let min_x = self.col as f64 * edge_m;
        let min_y = self.row as f64 * edge_m;
        BoundingBox::new(min_x, min_y, min_x + edge_m, min_y + edge_m)
    }

    /// Projected centre of the square.
    pub fn center(&self, edge_m: f64) -> (f64, f64) {
        (
            (self.col as f64 + 0.5) * edge_m,
            (self.row as f64 + 0.5) * edge_m,
        )
    }
}

/// One partition cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub raster: RasterCell,
    pub centroid: GeoPoint,
}

impl Cell {
    /// The square's corners in the projected frame, counter-clockwise from
    /// the lower-left.
    pub fn boundary(&self, edge_m: f64) -> [(f64, f64); 4] {
        let b = self.raster.bounds(edge_m);
        [
            (b.min_x, b.min_y),
            (b.max_x, b.min_y),
            (b.max_x, b.max_y),
            (b.min_x, b.max_y),
        ]
    }
}
