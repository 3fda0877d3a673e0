//! Path utilities for locating test data files.

use std::path::PathBuf;

/// Returns the workspace root directory.
pub fn workspace_root() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir)
        .parent() // crates/
        .and_then(|p| p.parent()) // workspace root
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from(manifest_dir))
}

/// Workspace-level directory for large, optional test data.
pub fn testdata_dir() -> PathBuf {
    workspace_root().join("testdata")
}

/// Searches for a test file.
///
/// Checks, in order:
/// 1. `TEST_DATA_DIR` (if set)
/// 2. `<workspace>/testdata/`
/// 3. `crates/partition/testdata/`
pub fn find_test_file(name: &str) -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(test_data_dir) = std::env::var("TEST_DATA_DIR") {
        candidates.push(PathBuf::from(test_data_dir).join(name));
    }

    candidates.push(testdata_dir().join(name));
    candidates.push(
        workspace_root()
            .join("crates")
            .join("partition")
            .join("testdata")
            .join(name),
    );

    candidates.into_iter().find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_root_has_manifest() {
        assert!(workspace_root().join("Cargo.toml").exists());
    }

    #[test]
    fn test_missing_file_is_none() {
        assert!(find_test_file("definitely-not-here.geojson").is_none());
    }
}
