//! Region boundary input.
//!
//! The region arrives as GeoJSON in geodetic degrees (`[lon, lat]` positions).
//! `Polygon`, `MultiPolygon`, `GeometryCollection`, `Feature` and
//! `FeatureCollection` are accepted. Each polygon keeps its own rings (outer
//! boundary first, then holes). Interior is decided per polygon by the
//! even-odd rule and the region is the union of its polygons, so adjacent or
//! overlapping polygons (e.g. states) tile as their union.

use gridpoint_common::GeoPoint;
use serde_json::Value;

use crate::error::{PartitionError, PartitionResult};

/// One polygon's rings: the outer boundary followed by any holes.
pub type Polygon = Vec<Vec<GeoPoint>>;

/// A validated-on-demand set of polygons.
///
/// Rings are stored open: the closing vertex is never repeated.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    polygons: Vec<Polygon>,
}

impl Region {
    /// Build a single-polygon region from rings of points. Closing vertices
    /// and consecutive duplicates are dropped.
    pub fn from_rings(rings: Vec<Vec<GeoPoint>>) -> Self {
        Self::from_polygons(vec![rings])
    }

    /// Build a region from several polygons. Polygons without rings are
    /// dropped.
    pub fn from_polygons(polygons: Vec<Polygon>) -> Self {
        Self {
            polygons: polygons
                .into_iter()
                .filter(|rings| !rings.is_empty())
                .map(|rings| rings.into_iter().map(normalize_ring).collect())
                .collect(),
        }
    }

    /// A geodetic rectangle whose edges are densified so that the projected
    /// outline follows the parallels.
    pub fn from_bbox(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        const STEPS: usize = 32;
        let lerp = |a: f64, b: f64, t: usize| a + (b - a) * t as f64 / STEPS as f64;

        let mut ring = Vec::with_capacity(STEPS * 4);
        for t in 0..STEPS {
            ring.push(GeoPoint::new(min_lat, lerp(min_lon, max_lon, t)));
        }
        for t in 0..STEPS {
            ring.push(GeoPoint::new(lerp(min_lat, max_lat, t), max_lon));
        }
        for t in 0..STEPS {
            ring.push(GeoPoint::new(max_lat, lerp(max_lon, min_lon, t)));
        }
        for t in 0..STEPS {
            ring.push(GeoPoint::new(lerp(max_lat, min_lat, t), min_lon));
        }
        Self::from_rings(vec![ring])
    }

    /// Parse a GeoJSON document.
    pub fn from_geojson(text: &str) -> PartitionResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PartitionError::InvalidGeoJson(e.to_string()))?;
        Self::from_geojson_value(&value)
    }

    /// Parse an already-decoded GeoJSON value.
    pub fn from_geojson_value(value: &Value) -> PartitionResult<Self> {
        let mut polygons = Vec::new();
        collect_polygons(value, &mut polygons)?;
        let region = Self::from_polygons(polygons);
        if region.polygons.is_empty() {
            return Err(PartitionError::EmptyRegion);
        }
        Ok(region)
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    /// Every ring of every polygon, in order. Ring numbers in errors index
    /// into this sequence.
    pub fn rings(&self) -> impl Iterator<Item = &Vec<GeoPoint>> + '_ {
        self.polygons.iter().flatten()
    }

    pub fn vertex_count(&self) -> usize {
        self.rings().map(Vec::len).sum()
    }

    /// Geodetic checks only; planar checks happen after projection.
    pub(crate) fn validate_coordinates(&self) -> PartitionResult<()> {
        if self.polygons.is_empty() {
            return Err(PartitionError::EmptyRegion);
        }
        for (ring_idx, ring) in self.rings().enumerate() {
            if ring.len() < 3 {
                return Err(PartitionError::DegenerateRing {
                    ring: ring_idx,
                    vertices: ring.len(),
                });
            }
            for (vertex, p) in ring.iter().enumerate() {
                if !p.is_valid() {
                    return Err(PartitionError::InvalidCoordinate {
                        ring: ring_idx,
                        vertex,
                        lat: p.lat,
                        lon: p.lon,
                    });
                }
            }
        }
        Ok(())
    }
}

fn normalize_ring(ring: Vec<GeoPoint>) -> Vec<GeoPoint> {
    let mut out: Vec<GeoPoint> = Vec::with_capacity(ring.len());
    for p in ring {
        if out.last() != Some(&p) {
            out.push(p);
        }
    }
    while out.len() > 1 && out.first() == out.last() {
        out.pop();
    }
    out
}

fn collect_polygons(value: &Value, polygons: &mut Vec<Polygon>) -> PartitionResult<()> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| PartitionError::InvalidGeoJson("missing \"type\"".to_string()))?;

    match kind {
        "FeatureCollection" => {
            let features = array_field(value, "features")?;
            for feature in features {
                collect_polygons(feature, polygons)?;
            }
        }
        "Feature" => match value.get("geometry") {
            Some(Value::Null) | None => {}
            Some(geometry) => collect_polygons(geometry, polygons)?,
        },
        "GeometryCollection" => {
            for geometry in array_field(value, "geometries")? {
                collect_polygons(geometry, polygons)?;
            }
        }
        "Polygon" => {
            polygons.push(parse_polygon(array_field(value, "coordinates")?)?);
        }
        "MultiPolygon" => {
            for polygon in array_field(value, "coordinates")? {
                let polygon = polygon.as_array().ok_or_else(|| {
                    PartitionError::InvalidGeoJson("MultiPolygon member is not an array".into())
                })?;
                polygons.push(parse_polygon(polygon)?);
            }
        }
        other => return Err(PartitionError::UnsupportedGeometry(other.to_string())),
    }
    Ok(())
}

fn array_field<'a>(value: &'a Value, field: &str) -> PartitionResult<&'a Vec<Value>> {
    value
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| PartitionError::InvalidGeoJson(format!("missing array \"{}\"", field)))
}

fn parse_polygon(polygon: &[Value]) -> PartitionResult<Polygon> {
    let mut rings = Vec::with_capacity(polygon.len());
    for ring in polygon {
        let positions = ring
            .as_array()
            .ok_or_else(|| PartitionError::InvalidGeoJson("ring is not an array".into()))?;
        let mut points = Vec::with_capacity(positions.len());
        for position in positions {
            let pair = position.as_array().filter(|p| p.len() >= 2).ok_or_else(|| {
                PartitionError::InvalidGeoJson("position must be [lon, lat]".into())
            })?;
            let lon = pair[0].as_f64();
            let lat = pair[1].as_f64();
            match (lat, lon) {
                (Some(lat), Some(lon)) => points.push(GeoPoint::new(lat, lon)),
                _ => {
                    return Err(PartitionError::InvalidGeoJson(
                        "position values must be numbers".into(),
                    ))
                }
            }
        }
        rings.push(points);
    }
    Ok(rings)
}
