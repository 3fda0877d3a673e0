//! Common types and utilities shared across the gridpoint engine crates.

pub mod bbox;
pub mod cell;
pub mod error;
pub mod gridpoint;

pub use bbox::BoundingBox;
pub use cell::{Cell, CellId, GeoPoint, RasterCell};
pub use error::{GridpointError, GridpointResult};
pub use gridpoint::{GridpointId, PointMetadata};
