//! Albers Equal-Area Conic projection.
//!
//! The partition needs squares of equal ground area, so cells are laid out in
//! an equal-area frame rather than a conformal one. The CONUS parameters match
//! EPSG:5070 (NAD83 / Conus Albers):
//! - Ellipsoid: GRS80
//! - Latitude of origin: 23°N
//! - Central meridian: 96°W
//! - Standard parallels: 29.5°N and 45.5°N
//! - No false easting/northing
//!
//! Formulas follow Snyder, "Map Projections: A Working Manual" (USGS PP 1395),
//! ellipsoidal form.

use std::f64::consts::PI;

use thiserror::Error;

/// GRS80 semi-major axis (meters).
pub const GRS80_A: f64 = 6_378_137.0;
/// GRS80 inverse flattening.
pub const GRS80_INV_F: f64 = 298.257_222_101;

const MAX_INVERSE_ITERATIONS: usize = 25;
const INVERSE_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Error, PartialEq)]
pub enum ProjectionError {
    #[error("Standard parallels {0} and {1} are symmetric about the equator")]
    SymmetricParallels(f64, f64),

    #[error("Invalid projection parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

/// Albers Equal-Area Conic projection parameters.
#[derive(Debug, Clone)]
pub struct AlbersEqualArea {
    /// Central meridian in radians
    pub lon0: f64,
    /// Latitude of origin in radians
    pub lat0: f64,
    /// First standard parallel in radians
    pub lat1: f64,
    /// Second standard parallel in radians
    pub lat2: f64,
    /// Semi-major axis (meters)
    pub a: f64,
    /// First eccentricity
    e: f64,
    /// Eccentricity squared
    e2: f64,
    /// Cone constant
    n: f64,
    /// C constant
    c: f64,
    /// Rho at the latitude of origin
    rho0: f64,
}

impl AlbersEqualArea {
    /// Create a projection on the GRS80 ellipsoid.
    ///
    /// All angles in degrees.
    pub fn new(
        lat0_deg: f64,
        lon0_deg: f64,
        lat1_deg: f64,
        lat2_deg: f64,
    ) -> Result<Self, ProjectionError> {
        Self::with_ellipsoid(lat0_deg, lon0_deg, lat1_deg, lat2_deg, GRS80_A, GRS80_INV_F)
    }

    /// Create a projection on an arbitrary ellipsoid.
    pub fn with_ellipsoid(
        lat0_deg: f64,
        lon0_deg: f64,
        lat1_deg: f64,
        lat2_deg: f64,
        a: f64,
        inv_f: f64,
    ) -> Result<Self, ProjectionError> {
        for (name, value) in [
            ("lat0", lat0_deg),
            ("lat1", lat1_deg),
            ("lat2", lat2_deg),
        ] {
            if !value.is_finite() || value.abs() >= 90.0 {
                return Err(ProjectionError::InvalidParameter { name, value });
            }
        }
        if !lon0_deg.is_finite() {
            return Err(ProjectionError::InvalidParameter {
                name: "lon0",
                value: lon0_deg,
            });
        }
        if !(a.is_finite() && a > 0.0) {
            return Err(ProjectionError::InvalidParameter { name: "a", value: a });
        }
        if !(inv_f.is_finite() && inv_f > 1.0) {
            return Err(ProjectionError::InvalidParameter {
                name: "inv_f",
                value: inv_f,
            });
        }
        if (lat1_deg + lat2_deg).abs() < 1e-10 {
            return Err(ProjectionError::SymmetricParallels(lat1_deg, lat2_deg));
        }

        let to_rad = PI / 180.0;
        let lat0 = lat0_deg * to_rad;
        let lon0 = lon0_deg * to_rad;
        let lat1 = lat1_deg * to_rad;
        let lat2 = lat2_deg * to_rad;

        let f = 1.0 / inv_f;
        let e2 = 2.0 * f - f * f;
        let e = e2.sqrt();

        let m1 = m(lat1, e2);
        let m2 = m(lat2, e2);
        let q0 = q(lat0, e, e2);
        let q1 = q(lat1, e, e2);
        let q2 = q(lat2, e, e2);

        // Tangent cone when the parallels coincide
        let n = if (lat1 - lat2).abs() < 1e-10 {
            lat1.sin()
        } else {
            (m1 * m1 - m2 * m2) / (q2 - q1)
        };

        let c = m1 * m1 + n * q1;
        let rho0 = a * (c - n * q0).sqrt() / n;

        Ok(Self {
            lon0,
            lat0,
            lat1,
            lat2,
            a,
            e,
            e2,
            n,
            c,
            rho0,
        })
    }

    /// NAD83 / Conus Albers (EPSG:5070).
    pub fn conus() -> Self {
        // Fixed, valid parameters: construction cannot fail.
        match Self::new(23.0, -96.0, 29.5, 45.5) {
            Ok(proj) => proj,
            Err(e) => unreachable!("CONUS Albers parameters rejected: {e}"),
        }
    }

    /// Project geographic coordinates (degrees) to planar meters.
    ///
    /// Returns (x, y).
    pub fn forward(&self, lat_deg: f64, lon_deg: f64) -> (f64, f64) {
        let to_rad = PI / 180.0;
        let lat = lat_deg * to_rad;
        let lon = lon_deg * to_rad;

        // Normalize longitude difference to [-π, π]
        let mut dlon = lon - self.lon0;
        while dlon > PI {
            dlon -= 2.0 * PI;
        }
        while dlon < -PI {
            dlon += 2.0 * PI;
        }

        let q = q(lat, self.e, self.e2);
        let rho = self.a * (self.c - self.n * q).max(0.0).sqrt() / self.n;
        let theta = self.n * dlon;

        let x = rho * theta.sin();
        let y = self.rho0 - rho * theta.cos();
        (x, y)
    }

    /// Unproject planar meters back to geographic coordinates.
    ///
    /// Returns (lat, lon) in degrees.
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let to_deg = 180.0 / PI;

        let dy = self.rho0 - y;
        let (rho, theta) = if self.n < 0.0 {
            (-(x * x + dy * dy).sqrt(), (-x).atan2(-dy))
        } else {
            ((x * x + dy * dy).sqrt(), x.atan2(dy))
        };

        let q = (self.c - rho * rho * self.n * self.n / (self.a * self.a)) / self.n;
        let lat = self.latitude_from_q(q);
        let lon = self.lon0 + theta / self.n;

        (lat * to_deg, lon * to_deg)
    }

    /// Iterative inverse of q(φ) (Snyder eq. 3-16).
    fn latitude_from_q(&self, q: f64) -> f64 {
        let e = self.e;
        let e2 = self.e2;

        let mut phi = (q / 2.0).clamp(-1.0, 1.0).asin();
        for _ in 0..MAX_INVERSE_ITERATIONS {
            let sin_phi = phi.sin();
            let cos_phi = phi.cos();
            if cos_phi.abs() < 1e-12 {
                break;
            }
            let one_minus = 1.0 - e2 * sin_phi * sin_phi;
            let delta = one_minus * one_minus / (2.0 * cos_phi)
                * (q / (1.0 - e2) - sin_phi / one_minus
                    + (1.0 / (2.0 * e)) * ((1.0 - e * sin_phi) / (1.0 + e * sin_phi)).ln());
            phi += delta;
            if delta.abs() < INVERSE_TOLERANCE {
                break;
            }
        }
        phi
    }
}

/// Snyder eq. 14-15.
fn m(phi: f64, e2: f64) -> f64 {
    let s = phi.sin();
    phi.cos() / (1.0 - e2 * s * s).sqrt()
}

/// Snyder eq. 3-12.
fn q(phi: f64, e: f64, e2: f64) -> f64 {
    let s = phi.sin();
    (1.0 - e2) * (s / (1.0 - e2 * s * s) - (1.0 / (2.0 * e)) * ((1.0 - e * s) / (1.0 + e * s)).ln())
}
