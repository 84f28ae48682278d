//! Settings document resolution
//!
//! The baseline document is the `settings.json` shipped with the last build.
//! Each suite may override it: nested mappings are merged one level deep,
//! anything else is replaced outright. The baseline is read fresh for every
//! resolution and never written back.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

/// A settings document: top-level keys to arbitrary JSON values.
pub type Settings = Map<String, Value>;

/// Reserved key grouping the application's polling periods.
pub const INTERVALS_KEY: &str = "intervals";

/// Loads a baseline settings document and applies per-suite overrides.
#[derive(Debug, Clone)]
pub struct SettingsResolver {
    baseline_path: PathBuf,
}

impl SettingsResolver {
    pub fn new(baseline_path: impl Into<PathBuf>) -> Self {
        Self {
            baseline_path: baseline_path.into(),
        }
    }

    pub fn baseline_path(&self) -> &Path {
        &self.baseline_path
    }

    /// Load the baseline and return a merged copy.
    pub fn resolve(&self, overrides: &Settings) -> HarnessResult<Settings> {
        let baseline = load_baseline(&self.baseline_path)?;
        debug!(
            baseline = %self.baseline_path.display(),
            overrides = overrides.len(),
            "resolving settings"
        );
        Ok(merge_overrides(&baseline, overrides))
    }
}

/// Read a settings document, which must be a JSON object.
pub fn load_baseline(path: &Path) -> HarnessResult<Settings> {
    let content = std::fs::read_to_string(path).map_err(|e| HarnessError::Config {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(HarnessError::Config {
            path: path.to_path_buf(),
            reason: format!("expected a JSON object, found {}", kind_of(&other)),
        }),
        Err(e) => Err(HarnessError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Apply `overrides` to a copy of `baseline`.
///
/// When both sides hold a mapping under the same key the inner keys are merged
/// with the override winning; otherwise the override value replaces the
/// baseline value. Keys absent from `overrides` are left as they are.
pub fn merge_overrides(baseline: &Settings, overrides: &Settings) -> Settings {
    let mut resolved = baseline.clone();

    for (key, value) in overrides {
        match (resolved.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(inner)) => {
                for (inner_key, inner_value) in inner {
                    existing.insert(inner_key.clone(), inner_value.clone());
                }
            }
            _ => {
                resolved.insert(key.clone(), value.clone());
            }
        }
    }

    resolved
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn doc(value: Value) -> Settings {
        match value {
            Value::Object(map) => map,
            _ => panic!("test document must be an object"),
        }
    }

    fn baseline() -> Settings {
        doc(json!({
            "intervals": { "peerRefresh": 5000, "postRefresh": 1000 },
            "peerServer": { "host": "localhost", "port": 9000 },
            "debug": false,
            "name": "ephemeral"
        }))
    }

    #[test]
    fn test_baseline_only_keys_are_untouched() {
        let resolved = merge_overrides(&baseline(), &doc(json!({ "debug": true })));
        assert_eq!(resolved["name"], json!("ephemeral"));
        assert_eq!(resolved["peerServer"], baseline()["peerServer"]);
    }

    #[test]
    fn test_nested_mappings_merge_per_key() {
        let overrides = doc(json!({ "intervals": { "postRefresh": 50 } }));
        let resolved = merge_overrides(&baseline(), &overrides);
        assert_eq!(
            resolved[INTERVALS_KEY],
            json!({ "peerRefresh": 5000, "postRefresh": 50 })
        );
    }

    #[test_case(json!({ "debug": true }), "debug", json!(true) ; "primitive replaces primitive")]
    #[test_case(json!({ "name": { "full": "x" } }), "name", json!({ "full": "x" }) ; "mapping replaces primitive")]
    #[test_case(json!({ "intervals": 0 }), "intervals", json!(0) ; "primitive replaces mapping")]
    #[test_case(json!({ "extra": [1, 2] }), "extra", json!([1, 2]) ; "unknown key passes through")]
    fn test_non_mapping_overrides_replace(overrides: Value, key: &str, expected: Value) {
        let resolved = merge_overrides(&baseline(), &doc(overrides));
        assert_eq!(resolved[key], expected);
    }

    #[test]
    fn test_baseline_is_not_mutated() {
        let original = baseline();
        let overrides = doc(json!({ "intervals": { "peerRefresh": 1 }, "debug": true }));
        let _ = merge_overrides(&original, &overrides);
        assert_eq!(original, baseline());
    }

    #[test]
    fn test_resolve_reads_baseline_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, serde_json::to_string(&baseline()).unwrap()).unwrap();

        let resolver = SettingsResolver::new(&path);
        let resolved = resolver
            .resolve(&doc(json!({ "intervals": { "peerRefresh": 10 } })))
            .unwrap();
        assert_eq!(resolved[INTERVALS_KEY]["peerRefresh"], json!(10));

        // The file itself is left alone.
        let reloaded = load_baseline(&path).unwrap();
        assert_eq!(reloaded, baseline());
    }

    #[test_case("{ not json" ; "unparsable")]
    #[test_case("[1, 2, 3]" ; "not an object")]
    fn test_bad_baseline_is_config_error(content: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, content).unwrap();

        let err = SettingsResolver::new(&path).resolve(&Settings::new()).unwrap_err();
        assert!(matches!(err, HarnessError::Config { .. }), "{err}");
    }

    #[test]
    fn test_missing_baseline_is_config_error() {
        let err = load_baseline(Path::new("/nonexistent/settings.json")).unwrap_err();
        assert!(matches!(err, HarnessError::Config { .. }));
    }
}
