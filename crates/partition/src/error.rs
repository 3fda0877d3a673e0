//! Partition error types.

use thiserror::Error;

pub type PartitionResult<T> = Result<T, PartitionError>;

/// Errors that abort partition generation. No partial partition is produced.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("Region has no polygons")]
    EmptyRegion,

    #[error("Invalid GeoJSON: {0}")]
    InvalidGeoJson(String),

    #[error("Unsupported geometry type: {0}")]
    UnsupportedGeometry(String),

    #[error("Ring {ring} has {vertices} distinct vertices, need at least 3")]
    DegenerateRing { ring: usize, vertices: usize },

    #[error("Ring {ring} vertex {vertex} has invalid coordinate (lat={lat}, lon={lon})")]
    InvalidCoordinate {
        ring: usize,
        vertex: usize,
        lat: f64,
        lon: f64,
    },

    #[error("Ring {ring} encloses zero area")]
    ZeroAreaRing { ring: usize },

    #[error("Ring {ring} self-intersects between edges {first_edge} and {second_edge}")]
    SelfIntersection {
        ring: usize,
        first_edge: usize,
        second_edge: usize,
    },

    #[error("Rings {first_ring} and {second_ring} of one polygon cross each other")]
    RingsCross {
        first_ring: usize,
        second_ring: usize,
    },

    #[error("Invalid cell edge length: {0}")]
    InvalidEdgeLength(f64),

    #[error("Duplicate raster cell (row={row}, col={col})")]
    DuplicateCell { row: i64, col: i64 },
}
