//! Shared test utilities for the gridpoint engine workspace.
//!
//! This crate provides common testing infrastructure including:
//! - Test data path helpers and skip macros for optional boundary files
//! - Region fixtures (GeoJSON) and canned points-endpoint responses
//! - Coordinate sample generators and temporary database paths
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../../crates/test-utils" }
//! ```

pub mod fixtures;
pub mod generators;
pub mod paths;

pub use fixtures::*;
pub use generators::*;
pub use paths::*;

/// Skip a test if the required file is not found.
///
/// Used for tests that need large boundary files (e.g. the full CONUS state
/// outlines) that are not checked in.
///
/// ```ignore
/// use test_utils::require_test_file;
///
/// #[test]
/// fn test_conus_partition() {
///     let path = require_test_file!("conus_states.geojson");
/// }
/// ```
#[macro_export]
macro_rules! require_test_file {
    ($name:expr) => {{
        match $crate::find_test_file($name) {
            Some(path) => path,
            None => {
                eprintln!(
                    "SKIPPED: Test file '{}' not found. Download test data or set TEST_DATA_DIR.",
                    $name
                );
                return;
            }
        }
    }};
}
