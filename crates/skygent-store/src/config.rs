//! Per-store configuration (`stores/<name>/config.json`).

use serde::{Deserialize, Serialize};

use skygent_core::ids::StoreName;
use skygent_filter::FilterExpr;

use crate::checkpoints::{read_json, write_json_atomic};
use crate::errors::Result;
use crate::paths::StoreRoot;

/// Which commit pipeline `sync` dispatches to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Skip posts whose URI is already indexed (default).
    #[default]
    Dedupe,
    /// Append unconditionally, refreshing snapshots.
    Refresh,
}

/// Output toggles for a store or a configured filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatConfig {
    /// Emit JSON output.
    pub json: bool,
    /// Emit Markdown output.
    pub markdown: bool,
}

/// Output destination of a configured filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOutput {
    /// Destination path.
    pub path: String,
    /// Emit JSON.
    pub json: bool,
    /// Emit Markdown.
    pub markdown: bool,
}

/// One filter wired into a store's config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFilter {
    /// Filter name.
    pub name: String,
    /// The expression.
    pub expr: FilterExpr,
    /// Where its output goes.
    pub output: FilterOutput,
}

/// Store configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Output format toggles.
    pub format: FormatConfig,
    /// Sync on store access.
    pub auto_sync: bool,
    /// Commit pipeline policy.
    pub sync_policy: SyncPolicy,
    /// Configured filters.
    pub filters: Vec<ConfigFilter>,
}

impl StoreConfig {
    /// Load a store's config, defaults when the file is absent.
    pub fn load(root: &StoreRoot, name: &StoreName) -> Result<Self> {
        Ok(read_json(&root.config_path(name))?.unwrap_or_default())
    }

    /// Persist a store's config.
    pub fn save(&self, root: &StoreRoot, name: &StoreName) -> Result<()> {
        write_json_atomic(&root.config_path(name), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let root = StoreRoot::new(dir.path());
        let name = StoreName::new("demo").unwrap();
        let config = StoreConfig::load(&root, &name).unwrap();
        assert_eq!(config.sync_policy, SyncPolicy::Dedupe);
        assert!(!config.auto_sync);
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = StoreRoot::new(dir.path());
        let name = StoreName::new("demo").unwrap();
        std::fs::create_dir_all(root.store_dir(&name)).unwrap();

        let config = StoreConfig {
            format: FormatConfig {
                json: true,
                markdown: false,
            },
            auto_sync: true,
            sync_policy: SyncPolicy::Refresh,
            filters: vec![ConfigFilter {
                name: "tech".into(),
                expr: FilterExpr::All,
                output: FilterOutput {
                    path: "out/tech.json".into(),
                    json: true,
                    markdown: false,
                },
            }],
        };
        config.save(&root, &name).unwrap();
        assert_eq!(StoreConfig::load(&root, &name).unwrap(), config);
    }

    #[test]
    fn sync_policy_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(SyncPolicy::Refresh).unwrap(),
            serde_json::json!("refresh")
        );
    }
}
