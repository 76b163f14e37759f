pub mod manifest;

pub use manifest::{
    parse_manifest_json, parse_manifest_yaml, validate_manifest, GroupSpec, Manifest,
    ManifestError, ReconcilerSpec, ValidationTargets, WarmPoolSpec, DEMO_MANIFEST,
};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Manifest error: {0}")]
    ManifestError(#[from] ManifestError),
}

/// Expand `~` and environment variables in a user-supplied path
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load and validate a manifest from disk. `.json` files are read as JSON,
/// everything else as YAML.
pub fn load_manifest_file(path: &Path) -> Result<Manifest, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let manifest = if is_json {
        Manifest::from_json(&content)?
    } else {
        Manifest::from_yaml(&content)?
    };
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml_manifest() {
        let file = create_temp_file(".yaml", DEMO_MANIFEST);
        let manifest = load_manifest_file(file.path()).unwrap();
        assert_eq!(manifest.groups.len(), 2);
    }

    #[test]
    fn test_load_json_manifest() {
        let json = serde_json::to_string(&Manifest::demo()).unwrap();
        let file = create_temp_file(".json", &json);
        let manifest = load_manifest_file(file.path()).unwrap();
        assert_eq!(manifest, Manifest::demo());
    }

    #[test]
    fn test_invalid_manifest_file() {
        let file = create_temp_file(".yml", "groups: [{name: x}]");
        let result = load_manifest_file(file.path());
        assert!(matches!(result, Err(ConfigError::ManifestError(_))));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_manifest_file(Path::new("/nonexistent/fleet.yaml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/fleet.yaml");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(expand_path("/etc/fleet.yaml"), PathBuf::from("/etc/fleet.yaml"));
    }
}
