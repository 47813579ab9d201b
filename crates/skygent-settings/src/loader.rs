//! Settings loading: file layer + env layer over compiled defaults.

use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::types::{OutputFormat, Settings};

/// Settings load failure.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// `settings.json` exists but cannot be read.
    #[error("cannot read settings file {path}: {source}")]
    Io {
        /// The file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// `settings.json` is not valid JSON (or not a settings shape).
    #[error("invalid settings file {path}: {source}")]
    Parse {
        /// The file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// An env var override holds an unusable value.
    #[error("invalid value for {var}: {value:?}")]
    Env {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Deep-merge `overlay` into `base`: objects merge recursively, everything
/// else (including arrays) is replaced.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                let _ = base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Load settings: defaults ← `<storeRoot>/settings.json` ← `SKYGENT_*` env.
pub fn load_settings() -> Result<Settings, SettingsError> {
    let root = std::env::var_os("SKYGENT_STORE_ROOT")
        .map_or_else(|| PathBuf::from("./.skygent"), PathBuf::from);
    load_settings_from_root(&root)
}

/// Load settings for an explicit root (test seam).
pub fn load_settings_from_root(root: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default()).unwrap_or(Value::Null);

    let path = root.join("settings.json");
    let merged = if path.exists() {
        let raw = std::fs::read(&path).map_err(|e| SettingsError::Io {
            path: path.clone(),
            source: e,
        })?;
        let file: Value = serde_json::from_slice(&raw).map_err(|e| SettingsError::Parse {
            path: path.clone(),
            source: e,
        })?;
        deep_merge(defaults, file)
    } else {
        defaults
    };

    let mut settings: Settings =
        serde_json::from_value(merged).map_err(|e| SettingsError::Parse {
            path: path.clone(),
            source: e,
        })?;
    settings.store_root = Some(root.to_path_buf());
    apply_env_overrides(&mut settings)?;
    Ok(settings.clamped())
}

fn apply_env_overrides(settings: &mut Settings) -> Result<(), SettingsError> {
    if let Ok(value) = std::env::var("SKYGENT_OUTPUT_FORMAT") {
        settings.output_format = match value.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "text" => OutputFormat::Text,
            _ => {
                return Err(SettingsError::Env {
                    var: "SKYGENT_OUTPUT_FORMAT",
                    value,
                });
            }
        };
    }
    override_parsed(
        "SKYGENT_PROFILE_BATCH_SIZE",
        &mut settings.identity.profile_batch_size,
    )?;
    override_parsed(
        "SKYGENT_PROFILE_CACHE_CAPACITY",
        &mut settings.identity.profile_cache_capacity,
    )?;
    override_parsed(
        "SKYGENT_PROFILE_CACHE_TTL",
        &mut settings.identity.profile_cache_ttl_secs,
    )?;
    override_bool("SKYGENT_IDENTITY_STRICT", &mut settings.identity.strict)?;
    override_bool("SKYGENT_IMAGE_CACHE_ENABLED", &mut settings.images.enabled)?;
    override_parsed(
        "SKYGENT_IMAGE_FETCH_MAX_BYTES",
        &mut settings.images.fetch_max_bytes,
    )?;
    override_parsed(
        "SKYGENT_IMAGE_FETCH_BATCH_WINDOW",
        &mut settings.images.fetch_batch_window_ms,
    )?;
    override_parsed(
        "SKYGENT_IMAGE_FETCH_CONCURRENCY",
        &mut settings.images.fetch_concurrency,
    )?;
    override_parsed(
        "SKYGENT_IMAGE_CACHE_TTL",
        &mut settings.images.cache_ttl_secs,
    )?;
    override_parsed(
        "SKYGENT_IMAGE_FAILURE_TTL",
        &mut settings.images.failure_ttl_secs,
    )?;
    override_parsed(
        "SKYGENT_DERIVATION_CHECKPOINT_EVERY",
        &mut settings.sync.derivation_checkpoint_every,
    )?;
    override_parsed(
        "SKYGENT_DERIVATION_CHECKPOINT_INTERVAL_MS",
        &mut settings.sync.derivation_checkpoint_interval_ms,
    )?;
    Ok(())
}

fn override_parsed<T: std::str::FromStr>(
    var: &'static str,
    slot: &mut T,
) -> Result<(), SettingsError> {
    if let Ok(value) = std::env::var(var) {
        *slot = value
            .parse()
            .map_err(|_| SettingsError::Env { var, value })?;
    }
    Ok(())
}

fn override_bool(var: &'static str, slot: &mut bool) -> Result<(), SettingsError> {
    if let Ok(value) = std::env::var(var) {
        *slot = match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => return Err(SettingsError::Env { var, value }),
        };
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
// Env mutation is `unsafe` in edition 2024; confined to tests behind a lock.
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Env-mutating tests serialize behind this lock (tests run in
    /// parallel threads and the process env is shared).
    static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn clear_skygent_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("SKYGENT_") {
                // Safety gate in newer std: single-threaded within the lock.
                unsafe { std::env::remove_var(&key) };
            }
        }
    }

    #[test]
    fn deep_merge_nested_objects() {
        let base = json!({"a": {"x": 1, "y": 2}, "b": 3});
        let overlay = json!({"a": {"y": 20}, "c": 4});
        let merged = deep_merge(base, overlay);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 20}, "b": 3, "c": 4}));
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let merged = deep_merge(json!({"a": [1, 2]}), json!({"a": [3]}));
        assert_eq!(merged, json!({"a": [3]}));
    }

    #[test]
    fn file_layer_merges_over_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_skygent_env();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            serde_json::to_vec(&json!({
                "identity": {"profileBatchSize": 12},
                "outputFormat": "text",
            }))
            .unwrap(),
        )
        .unwrap();

        let settings = load_settings_from_root(dir.path()).unwrap();
        assert_eq!(settings.identity.profile_batch_size, 12);
        assert_eq!(settings.output_format, OutputFormat::Text);
        assert_eq!(settings.identity.profile_cache_capacity, 5000);
        assert_eq!(settings.store_root, Some(dir.path().to_path_buf()));
    }

    #[test]
    fn env_layer_wins_over_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_skygent_env();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            serde_json::to_vec(&json!({"identity": {"profileBatchSize": 12}})).unwrap(),
        )
        .unwrap();
        unsafe { std::env::set_var("SKYGENT_PROFILE_BATCH_SIZE", "3") };

        let settings = load_settings_from_root(dir.path()).unwrap();
        assert_eq!(settings.identity.profile_batch_size, 3);
        clear_skygent_env();
    }

    #[test]
    fn batch_size_env_is_clamped() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_skygent_env();
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("SKYGENT_PROFILE_BATCH_SIZE", "9999") };
        let settings = load_settings_from_root(dir.path()).unwrap();
        assert_eq!(settings.identity.profile_batch_size, 25);
        clear_skygent_env();
    }

    #[test]
    fn malformed_env_value_errors() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_skygent_env();
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("SKYGENT_PROFILE_BATCH_SIZE", "not-a-number") };
        assert!(load_settings_from_root(dir.path()).is_err());
        clear_skygent_env();
    }

    #[test]
    fn malformed_file_errors() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_skygent_env();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), b"{not json").unwrap();
        assert!(matches!(
            load_settings_from_root(dir.path()),
            Err(SettingsError::Parse { .. })
        ));
    }
}
