//! Forecast gridpoint identifiers.
//!
//! A gridpoint is the authority's coarse forecast cell, addressed by the
//! issuing forecast office and an integer X/Y position on that office's grid.
//! The canonical string form is the path segment the forecast endpoints use:
//!
//! ```text
//! TOP/32,81  ->  /gridpoints/TOP/32,81/forecast
//!                /gridpoints/TOP/32,81/forecast/hourly
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GridpointError, GridpointResult};

/// Validated forecast gridpoint identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawGridpoint")]
pub struct GridpointId {
    office_code: String,
    grid_x: u32,
    grid_y: u32,
}

#[derive(Deserialize)]
struct RawGridpoint {
    office_code: String,
    grid_x: i64,
    grid_y: i64,
}

impl TryFrom<RawGridpoint> for GridpointId {
    type Error = GridpointError;

    fn try_from(raw: RawGridpoint) -> GridpointResult<Self> {
        Self::from_raw(&raw.office_code, raw.grid_x, raw.grid_y)
    }
}

impl GridpointId {
    /// Create a gridpoint, validating the office code.
    pub fn new(office_code: &str, grid_x: u32, grid_y: u32) -> GridpointResult<Self> {
        if !is_valid_office_code(office_code) {
            return Err(GridpointError::InvalidOfficeCode(office_code.to_string()));
        }
        Ok(Self {
            office_code: office_code.to_string(),
            grid_x,
            grid_y,
        })
    }

    /// Create a gridpoint from signed indices as they arrive from JSON or SQL.
    pub fn from_raw(office_code: &str, grid_x: i64, grid_y: i64) -> GridpointResult<Self> {
        let grid_x = u32::try_from(grid_x).map_err(|_| GridpointError::InvalidGridIndex {
            axis: "grid_x",
            value: grid_x,
        })?;
        let grid_y = u32::try_from(grid_y).map_err(|_| GridpointError::InvalidGridIndex {
            axis: "grid_y",
            value: grid_y,
        })?;
        Self::new(office_code, grid_x, grid_y)
    }

    pub fn office_code(&self) -> &str {
        &self.office_code
    }

    pub fn grid_x(&self) -> u32 {
        self.grid_x
    }

    pub fn grid_y(&self) -> u32 {
        self.grid_y
    }

    /// Path to the daily forecast for this gridpoint.
    pub fn forecast_path(&self) -> String {
        format!("/gridpoints/{}/forecast", self)
    }

    /// Path to the hourly forecast for this gridpoint.
    pub fn forecast_hourly_path(&self) -> String {
        format!("/gridpoints/{}/forecast/hourly", self)
    }
}

impl fmt::Display for GridpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{},{}", self.office_code, self.grid_x, self.grid_y)
    }
}

impl FromStr for GridpointId {
    type Err = GridpointError;

    /// Parse the canonical `OFFICE/x,y` form.
    fn from_str(s: &str) -> GridpointResult<Self> {
        let invalid = || GridpointError::InvalidGridpoint(s.to_string());

        let (office, xy) = s.split_once('/').ok_or_else(invalid)?;
        let (x, y) = xy.split_once(',').ok_or_else(invalid)?;
        let x: u32 = x.trim().parse().map_err(|_| invalid())?;
        let y: u32 = y.trim().parse().map_err(|_| invalid())?;

        Self::new(office.trim(), x, y)
    }
}

/// Three ASCII uppercase letters.
pub fn is_valid_office_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}

/// Extra fields the points endpoint returns next to the gridpoint.
///
/// Stored per cell with the latest answer; changes here never open a new
/// version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointMetadata {
    pub forecast_url: Option<String>,
    pub forecast_hourly_url: Option<String>,
    pub forecast_office_url: Option<String>,
    pub forecast_grid_data_url: Option<String>,
    pub observation_stations_url: Option<String>,
    pub forecast_zone_url: Option<String>,
    pub time_zone: Option<String>,
    pub radar_station: Option<String>,
}
