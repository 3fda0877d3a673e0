//! Region partitioning and spatial lookup.
//!
//! The region boundary is projected into an equal-area frame and covered by
//! an absolute square raster. Every square touching the region becomes a
//! cell; the spatial index maps any coordinate back to its cell by floor
//! division, without a spatial tree.

pub mod error;
pub mod index;
pub mod partitioner;
pub mod region;

pub use error::{PartitionError, PartitionResult};
pub use index::{IndexHandle, SpatialIndex};
pub use partitioner::{Partition, PartitionCell, Partitioner, DEFAULT_EDGE_M};
pub use region::Region;
