//! Generators for synthetic coordinates and scratch storage.

use std::path::PathBuf;

/// Evenly spaced `(lat, lon)` samples across a geodetic box.
///
/// Produces `steps * steps` points strictly inside the box (samples sit at the
/// centres of a `steps x steps` lattice, never on an edge).
///
/// ```
/// use test_utils::sample_points;
///
/// let pts = sample_points((-100.0, 40.0, -99.0, 41.0), 4);
/// assert_eq!(pts.len(), 16);
/// assert!(pts.iter().all(|(lat, lon)| *lat > 40.0 && *lon < -99.0));
/// ```
pub fn sample_points(bbox: (f64, f64, f64, f64), steps: usize) -> Vec<(f64, f64)> {
    let (min_lon, min_lat, max_lon, max_lat) = bbox;
    let dlon = (max_lon - min_lon) / steps as f64;
    let dlat = (max_lat - min_lat) / steps as f64;

    let mut out = Vec::with_capacity(steps * steps);
    for i in 0..steps {
        for j in 0..steps {
            out.push((
                min_lat + (i as f64 + 0.5) * dlat,
                min_lon + (j as f64 + 0.5) * dlon,
            ));
        }
    }
    out
}

/// Deterministic pseudo-random `(lat, lon)` points inside a box.
///
/// Uses a fixed linear congruential sequence so failures reproduce.
pub fn scattered_points(bbox: (f64, f64, f64, f64), count: usize, seed: u64) -> Vec<(f64, f64)> {
    let (min_lon, min_lat, max_lon, max_lat) = bbox;
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    (0..count)
        .map(|_| {
            let lat = min_lat + next() * (max_lat - min_lat);
            let lon = min_lon + next() * (max_lon - min_lon);
            (lat, lon)
        })
        .collect()
}

/// A scratch directory plus a database path inside it.
///
/// Keep the returned `TempDir` alive for as long as the database is used.
pub fn temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("failed to create temp dir: {e}"),
    };
    let path = dir.path().join(name);
    (dir, path)
}
