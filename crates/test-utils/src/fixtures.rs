//! Common test fixtures for gridpoint engine tests.
//!
//! Region boundaries are GeoJSON strings in `[lon, lat]` order. Points
//! responses mirror the shape returned by `GET /points/{lat},{lon}`.

/// Named geodetic boxes `(min_lon, min_lat, max_lon, max_lat)`.
pub mod bbox {
    /// Northeast Kansas, containing the Topeka office example point.
    pub const KANSAS: (f64, f64, f64, f64) = (-97.5, 39.0, -96.5, 40.0);

    /// A box small enough to partition into a handful of cells.
    pub const TINY: (f64, f64, f64, f64) = (-97.1, 39.7, -97.05, 39.75);

    /// Rough CONUS envelope.
    pub const CONUS: (f64, f64, f64, f64) = (-125.0, 24.0, -66.5, 49.5);
}

/// Named sample coordinates `(lat, lon)`.
pub mod points {
    /// Inside the Topeka forecast office area; resolves to `TOP/32,81`.
    pub const TOPEKA: (f64, f64) = (39.7451, -97.0799);

    /// Off the Pacific coast, outside any CONUS region.
    pub const PACIFIC: (f64, f64) = (35.0, -140.0);

    /// London, far outside the projection's useful extent.
    pub const LONDON: (f64, f64) = (51.5, -0.12);
}

/// Region boundaries as GeoJSON documents.
pub mod regions {
    /// Single polygon covering [`super::bbox::KANSAS`].
    pub fn kansas_box() -> String {
        let (w, s, e, n) = super::bbox::KANSAS;
        polygon(&[&[(w, s), (e, s), (e, n), (w, n)]])
    }

    /// An L-shaped polygon: a concave outline with no holes.
    pub fn l_shape() -> String {
        polygon(&[&[
            (-98.0, 38.0),
            (-96.0, 38.0),
            (-96.0, 38.5),
            (-97.5, 38.5),
            (-97.5, 40.0),
            (-98.0, 40.0),
        ]])
    }

    /// A square with a square hole in the middle.
    pub fn box_with_hole() -> String {
        polygon(&[
            &[(-98.0, 38.0), (-96.0, 38.0), (-96.0, 40.0), (-98.0, 40.0)],
            &[(-97.5, 38.5), (-96.5, 38.5), (-96.5, 39.5), (-97.5, 39.5)],
        ])
    }

    /// Two adjacent boxes sharing an edge, as separate features.
    pub fn adjacent_boxes() -> String {
        format!(
            r#"{{"type":"FeatureCollection","features":[{},{}]}}"#,
            feature(&polygon(&[&[
                (-98.0, 38.0),
                (-97.0, 38.0),
                (-97.0, 39.0),
                (-98.0, 39.0)
            ]])),
            feature(&polygon(&[&[
                (-97.0, 38.0),
                (-96.0, 38.0),
                (-96.0, 39.0),
                (-97.0, 39.0)
            ]])),
        )
    }

    /// Two boxes overlapping over `[-97.5, -97.0]`, as one `MultiPolygon`.
    pub fn overlapping_boxes() -> String {
        let a = polygon(&[&[(-98.0, 39.0), (-97.0, 39.0), (-97.0, 40.0), (-98.0, 40.0)]]);
        let b = polygon(&[&[(-97.5, 39.0), (-96.5, 39.0), (-96.5, 40.0), (-97.5, 40.0)]]);
        format!(
            r#"{{"type":"MultiPolygon","coordinates":[{},{}]}}"#,
            coordinates_of(&a),
            coordinates_of(&b)
        )
    }

    /// A polygon whose "hole" sticks out through the outer ring.
    pub fn hole_crossing_outer() -> String {
        polygon(&[
            &[(-98.0, 38.0), (-96.0, 38.0), (-96.0, 40.0), (-98.0, 40.0)],
            &[(-96.5, 38.5), (-95.5, 38.5), (-95.5, 39.5), (-96.5, 39.5)],
        ])
    }

    /// A self-intersecting "bowtie" ring.
    pub fn bowtie() -> String {
        polygon(&[&[(-98.0, 38.0), (-96.0, 40.0), (-96.0, 38.0), (-98.0, 40.0)]])
    }

    /// Build a `Polygon` document. Rings are closed automatically.
    pub fn polygon(rings: &[&[(f64, f64)]]) -> String {
        let rings: Vec<String> = rings
            .iter()
            .map(|ring| {
                let mut coords: Vec<String> =
                    ring.iter().map(|(lon, lat)| format!("[{},{}]", lon, lat)).collect();
                if let Some((lon, lat)) = ring.first() {
                    coords.push(format!("[{},{}]", lon, lat));
                }
                format!("[{}]", coords.join(","))
            })
            .collect();
        format!(r#"{{"type":"Polygon","coordinates":[{}]}}"#, rings.join(","))
    }

    fn coordinates_of(polygon_doc: &str) -> String {
        let prefix = r#"{"type":"Polygon","coordinates":"#;
        polygon_doc
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or_default()
            .to_string()
    }

    fn feature(geometry: &str) -> String {
        format!(r#"{{"type":"Feature","properties":{{}},"geometry":{}}}"#, geometry)
    }
}

/// Canned `/points` responses.
pub mod responses {
    use serde_json::{json, Value};

    /// A well-formed points response for the given gridpoint.
    pub fn points(office: &str, grid_x: i64, grid_y: i64, lat: f64, lon: f64) -> Value {
        let base = format!("https://api.weather.gov/gridpoints/{office}/{grid_x},{grid_y}");
        json!({
            "id": format!("https://api.weather.gov/points/{lat:.4},{lon:.4}"),
            "type": "Feature",
            "geometry": { "type": "Point", "coordinates": [lon, lat] },
            "properties": {
                "gridId": office,
                "gridX": grid_x,
                "gridY": grid_y,
                "forecast": format!("{base}/forecast"),
                "forecastHourly": format!("{base}/forecast/hourly"),
                "forecastOffice": format!("https://api.weather.gov/offices/{office}"),
                "forecastGridData": base,
                "observationStations": format!("{base}/stations"),
                "forecastZone": "https://api.weather.gov/zones/forecast/KSZ024",
                "timeZone": "America/Chicago",
                "radarStation": "KTWX"
            }
        })
    }

    /// The Topeka example: `TOP/32,81`.
    pub fn topeka() -> Value {
        let (lat, lon) = super::points::TOPEKA;
        points("TOP", 32, 81, lat, lon)
    }

    /// A 200 response missing `gridX`.
    pub fn missing_grid_x() -> Value {
        let mut body = topeka();
        if let Some(props) = body.get_mut("properties").and_then(Value::as_object_mut) {
            props.remove("gridX");
        }
        body
    }

    /// Problem document returned for points outside coverage.
    pub fn not_found(lat: f64, lon: f64) -> Value {
        json!({
            "correlationId": "0",
            "title": "Data Unavailable For Requested Point",
            "type": "https://api.weather.gov/problems/InvalidPoint",
            "status": 404,
            "detail": format!("Unable to provide data for requested point {lat:.4},{lon:.4}")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_closes_rings() {
        let doc = regions::polygon(&[&[(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)]]);
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        let ring = &value["coordinates"][0];
        assert_eq!(ring.as_array().unwrap().len(), 4);
        assert_eq!(ring[0], ring[3]);
    }

    #[test]
    fn test_fixture_documents_parse() {
        for doc in [
            regions::kansas_box(),
            regions::l_shape(),
            regions::box_with_hole(),
            regions::adjacent_boxes(),
            regions::overlapping_boxes(),
            regions::hole_crossing_outer(),
            regions::bowtie(),
        ] {
            assert!(serde_json::from_str::<serde_json::Value>(&doc).is_ok(), "{doc}");
        }
    }

    #[test]
    fn test_topeka_response_fields() {
        let body = responses::topeka();
        assert_eq!(body["properties"]["gridId"], "TOP");
        assert_eq!(body["properties"]["gridX"], 32);
        assert!(responses::missing_grid_x()["properties"].get("gridX").is_none());
    }
}
