//! Cell partitioner.
//!
//! Covers a region with the absolute square raster of the equal-area frame:
//!
//! 1. Project every boundary vertex into the frame.
//! 2. Validate the planar rings (simple, non-zero area, rings of one polygon
//!    never cross each other).
//! 3. For each polygon and raster row, keep every column a boundary edge
//!    passes through, plus every column whose centre lies inside (even-odd
//!    rule over that polygon's rings).
//! 4. Union the polygons' squares and inverse-project each square's centre
//!    to get the centroid.
//!
//! A square not crossed by any edge is either wholly inside or wholly
//! outside, so its centre decides. Squares crossed by an edge are partially
//! inside and kept in full: the partition covers the region and may
//! overshoot the true boundary by less than one cell.

use std::collections::BTreeSet;

use gridpoint_common::{BoundingBox, Cell, CellId, GeoPoint, RasterCell};
use projection::AlbersEqualArea;
use tracing::{debug, info};

use crate::error::{PartitionError, PartitionResult};
use crate::region::Region;

/// Default cell edge length (2.5 km).
pub const DEFAULT_EDGE_M: f64 = 2500.0;

/// A kept raster square before a cell id has been minted for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionCell {
    pub raster: RasterCell,
    pub centroid: GeoPoint,
}

/// Output of a partition run, in row-major order.
#[derive(Debug, Clone)]
pub struct Partition {
    pub edge_m: f64,
    pub cells: Vec<PartitionCell>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Mint ids 1..=n in row-major order. Used when no catalog exists yet.
    pub fn with_sequential_ids(&self) -> Vec<Cell> {
        self.cells
            .iter()
            .enumerate()
            .map(|(i, c)| Cell {
                id: CellId(i as i64 + 1),
                raster: c.raster,
                centroid: c.centroid,
            })
            .collect()
    }
}

type Ring = Vec<(f64, f64)>;

/// Partitions regions into equal-area square cells.
#[derive(Debug, Clone)]
pub struct Partitioner {
    projection: AlbersEqualArea,
    edge_m: f64,
}

impl Partitioner {
    pub fn new(projection: AlbersEqualArea, edge_m: f64) -> PartitionResult<Self> {
        if !(edge_m.is_finite() && edge_m > 0.0) {
            return Err(PartitionError::InvalidEdgeLength(edge_m));
        }
        Ok(Self { projection, edge_m })
    }

    /// CONUS Albers with 2.5 km cells.
    pub fn conus() -> Self {
        Self {
            projection: AlbersEqualArea::conus(),
            edge_m: DEFAULT_EDGE_M,
        }
    }

    pub fn projection(&self) -> &AlbersEqualArea {
        &self.projection
    }

    pub fn edge_m(&self) -> f64 {
        self.edge_m
    }

    /// Produce the full, deterministic tiling of `region`.
    pub fn partition(&self, region: &Region) -> PartitionResult<Partition> {
        region.validate_coordinates()?;

        let polygons: Vec<Vec<Ring>> = region
            .polygons()
            .iter()
            .map(|rings| {
                rings
                    .iter()
                    .map(|ring| {
                        ring.iter()
                            .map(|p| self.projection.forward(p.lat, p.lon))
                            .collect()
                    })
                    .collect()
            })
            .collect();

        let mut ring_offset = 0;
        for rings in &polygons {
            for (idx, ring) in rings.iter().enumerate() {
                validate_ring(ring_offset + idx, ring)?;
            }
            if let Some((first, second)) = find_ring_crossing(rings) {
                return Err(PartitionError::RingsCross {
                    first_ring: ring_offset + first,
                    second_ring: ring_offset + second,
                });
            }
            ring_offset += rings.len();
        }

        // Union of the per-polygon fills, ordered row-major
        let mut squares: BTreeSet<(i64, i64)> = BTreeSet::new();
        for rings in &polygons {
            let bbox = BoundingBox::from_points(rings.iter().flatten().copied())
                .ok_or(PartitionError::EmptyRegion)?;
            squares.extend(self.rasterize(rings, &bbox));
        }

        let cells: Vec<PartitionCell> = squares
            .into_iter()
            .map(|(row, col)| {
                let raster = RasterCell::new(row, col);
                let (cx, cy) = raster.center(self.edge_m);
                let (lat, lon) = self.projection.inverse(cx, cy);
                PartitionCell {
                    raster,
                    centroid: GeoPoint::new(lat, lon),
                }
            })
            .collect();

        info!(
            polygons = polygons.len(),
            rings = ring_offset,
            vertices = region.vertex_count(),
            edge_m = self.edge_m,
            cells = cells.len(),
            "Partition complete"
        );

        Ok(Partition {
            edge_m: self.edge_m,
            cells,
        })
    }

    /// Raster squares `(row, col)` covering one polygon.
    fn rasterize(&self, rings: &[Ring], bbox: &BoundingBox) -> BTreeSet<(i64, i64)> {
        let edge = self.edge_m;
        let row_min = (bbox.min_y / edge).floor() as i64;
        let row_max = (bbox.max_y / edge).floor() as i64;
        let row_count = (row_max - row_min + 1) as usize;

        // Bucket edges by the rows their y-extent spans
        let mut buckets: Vec<Vec<((f64, f64), (f64, f64))>> = vec![Vec::new(); row_count];
        for ring in rings {
            for (a, b) in ring_edges(ring) {
                let lo = (a.1.min(b.1) / edge).floor() as i64;
                let hi = (a.1.max(b.1) / edge).floor() as i64;
                for row in lo.max(row_min)..=hi.min(row_max) {
                    buckets[(row - row_min) as usize].push((a, b));
                }
            }
        }

        let mut squares = BTreeSet::new();
        for (offset, edges) in buckets.iter().enumerate() {
            if edges.is_empty() {
                continue;
            }
            let row = row_min + offset as i64;
            let y0 = row as f64 * edge;
            let y1 = y0 + edge;
            let y_mid = y0 + edge / 2.0;

            // Squares crossed by the boundary
            for &(a, b) in edges {
                if let Some((xa, xb)) = clip_to_band(a, b, y0, y1) {
                    let c0 = (xa / edge).floor() as i64;
                    let c1 = (xb / edge).floor() as i64;
                    squares.extend((c0..=c1).map(|col| (row, col)));
                }
            }

            // Squares whose centre is inside
            let mut crossings: Vec<f64> = edges
                .iter()
                .filter(|(a, b)| (a.1 <= y_mid) != (b.1 <= y_mid))
                .map(|(a, b)| a.0 + (y_mid - a.1) * (b.0 - a.0) / (b.1 - a.1))
                .collect();
            crossings.sort_by(f64::total_cmp);

            for span in crossings.chunks_exact(2) {
                // centre (c + 0.5) * edge strictly inside (span[0], span[1])
                let first = (span[0] / edge - 0.5).floor() as i64 + 1;
                let last = (span[1] / edge - 0.5).ceil() as i64 - 1;
                if first <= last {
                    squares.extend((first..=last).map(|col| (row, col)));
                }
            }
        }

        debug!(rows = row_count, squares = squares.len(), "Rasterized polygon");
        squares
    }
}

fn ring_edges(ring: &[(f64, f64)]) -> impl Iterator<Item = ((f64, f64), (f64, f64))> + '_ {
    (0..ring.len()).map(move |i| (ring[i], ring[(i + 1) % ring.len()]))
}

/// X-extent of segment `a-b` within the horizontal band `[y0, y1]`.
fn clip_to_band(a: (f64, f64), b: (f64, f64), y0: f64, y1: f64) -> Option<(f64, f64)> {
    let (lo, hi) = if a.1 <= b.1 { (a, b) } else { (b, a) };
    if hi.1 < y0 || lo.1 > y1 {
        return None;
    }
    if (hi.1 - lo.1).abs() < f64::EPSILON {
        return Some((lo.0.min(hi.0), lo.0.max(hi.0)));
    }
    let x_at = |y: f64| lo.0 + (y - lo.1) * (hi.0 - lo.0) / (hi.1 - lo.1);
    let xa = x_at(lo.1.max(y0));
    let xb = x_at(hi.1.min(y1));
    Some((xa.min(xb), xa.max(xb)))
}

/// Planar checks: enough distinct vertices, non-zero area, simple ring.
fn validate_ring(idx: usize, ring: &[(f64, f64)]) -> PartitionResult<()> {
    if ring.len() < 3 {
        return Err(PartitionError::DegenerateRing {
            ring: idx,
            vertices: ring.len(),
        });
    }

    // Crossing rings can have zero net area, so they are reported first
    if let Some((first_edge, second_edge)) = find_self_intersection(ring) {
        return Err(PartitionError::SelfIntersection {
            ring: idx,
            first_edge,
            second_edge,
        });
    }

    let twice_area: f64 = ring_edges(ring).map(|(a, b)| a.0 * b.1 - b.0 * a.1).sum();
    if twice_area.abs() < 1e-6 {
        return Err(PartitionError::ZeroAreaRing { ring: idx });
    }
    Ok(())
}

/// First pair of rings (by position in the polygon) whose edges properly
/// cross. Touching rings are allowed.
fn find_ring_crossing(rings: &[Ring]) -> Option<(usize, usize)> {
    if rings.len() < 2 {
        return None;
    }

    let mut edges: Vec<(usize, (f64, f64), (f64, f64))> = rings
        .iter()
        .enumerate()
        .flat_map(|(r, ring)| ring_edges(ring).map(move |(a, b)| (r, a, b)))
        .collect();
    edges.sort_by(|(_, a, b), (_, c, d)| a.0.min(b.0).total_cmp(&c.0.min(d.0)));

    for (pos, &(ri, a, b)) in edges.iter().enumerate() {
        let max_x = a.0.max(b.0);
        for &(rj, c, d) in &edges[pos + 1..] {
            if c.0.min(d.0) > max_x {
                break;
            }
            if ri != rj && segments_cross(a, b, c, d) {
                return Some((ri.min(rj), ri.max(rj)));
            }
        }
    }
    None
}

/// Sweep over edges sorted by min x, testing only x-overlapping pairs.
fn find_self_intersection(ring: &[(f64, f64)]) -> Option<(usize, usize)> {
    let n = ring.len();
    let edges: Vec<((f64, f64), (f64, f64))> = ring_edges(ring).collect();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        let (a, b) = edges[i];
        let (c, d) = edges[j];
        a.0.min(b.0).total_cmp(&c.0.min(d.0))
    });

    for (pos, &i) in order.iter().enumerate() {
        let (a, b) = edges[i];
        let max_x = a.0.max(b.0);
        for &j in &order[pos + 1..] {
            let (c, d) = edges[j];
            if c.0.min(d.0) > max_x {
                break;
            }
            let adjacent = (i + 1) % n == j || (j + 1) % n == i;
            let hit = if adjacent {
                collinear_overlap(a, b, c, d)
            } else {
                segments_intersect(a, b, c, d)
            };
            if hit {
                return Some((i.min(j), i.max(j)));
            }
        }
    }
    None
}

fn orientation(p: (f64, f64), q: (f64, f64), r: (f64, f64)) -> f64 {
    (q.0 - p.0) * (r.1 - p.1) - (q.1 - p.1) * (r.0 - p.0)
}

fn on_segment(p: (f64, f64), q: (f64, f64), r: (f64, f64)) -> bool {
    r.0 >= p.0.min(q.0) && r.0 <= p.0.max(q.0) && r.1 >= p.1.min(q.1) && r.1 <= p.1.max(q.1)
}

/// Interiors cross at a single point; shared endpoints and collinear
/// overlaps do not count.
fn segments_cross(a: (f64, f64), b: (f64, f64), c: (f64, f64), d: (f64, f64)) -> bool {
    let d1 = orientation(c, d, a);
    let d2 = orientation(c, d, b);
    let d3 = orientation(a, b, c);
    let d4 = orientation(a, b, d);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

fn segments_intersect(a: (f64, f64), b: (f64, f64), c: (f64, f64), d: (f64, f64)) -> bool {
    if segments_cross(a, b, c, d) {
        return true;
    }

    let d1 = orientation(c, d, a);
    let d2 = orientation(c, d, b);
    let d3 = orientation(a, b, c);
    let d4 = orientation(a, b, d);

    (d1 == 0.0 && on_segment(c, d, a))
        || (d2 == 0.0 && on_segment(c, d, b))
        || (d3 == 0.0 && on_segment(a, b, c))
        || (d4 == 0.0 && on_segment(a, b, d))
}

/// Adjacent edges share one vertex; they only conflict when they fold back
/// over each other.
fn collinear_overlap(a: (f64, f64), b: (f64, f64), c: (f64, f64), d: (f64, f64)) -> bool {
    if orientation(a, b, c) != 0.0 || orientation(a, b, d) != 0.0 {
        return false;
    }
    // Shared vertex is b == c or d == a; fold-back means the far endpoints
    // lie on the same side of it.
    let (shared, p, q) = if b == c { (b, a, d) } else { (a, b, c) };
    let dot = (p.0 - shared.0) * (q.0 - shared.0) + (p.1 - shared.1) * (q.1 - shared.1);
    dot > 0.0
}
