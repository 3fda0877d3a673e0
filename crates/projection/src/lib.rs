//! Coordinate reference system transformations.
//!
//! Implements map projections from scratch without external dependencies.

pub mod albers;

pub use albers::{AlbersEqualArea, ProjectionError};
