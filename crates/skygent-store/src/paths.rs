//! On-disk layout under the store root.
//!
//! ```text
//! <storeRoot>/
//!   stores/<name>/store.db        per-store SQLite database
//!   stores/<name>/config.json     store config
//!   stores/<name>/lineage.json    lineage record (derived stores)
//!   stores/<name>/checkpoints/    derivation checkpoints, one JSON per source
//!   filters/<name>.json           named filters
//!   locks/store-<name>/           advisory lock dirs
//!   images/                       image cache (owned by skygent-images)
//!   identity.db                   identity resolver L1 cache
//! ```

use std::path::{Path, PathBuf};

use skygent_core::ids::StoreName;

/// Root directory every skygent path hangs off.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreRoot(PathBuf);

impl StoreRoot {
    /// Wrap a root directory. Nothing is created yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The root itself.
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// `stores/` parent directory.
    pub fn stores_dir(&self) -> PathBuf {
        self.0.join("stores")
    }

    /// A store's directory.
    pub fn store_dir(&self, name: &StoreName) -> PathBuf {
        self.stores_dir().join(name.as_str())
    }

    /// A store's SQLite database file.
    pub fn db_path(&self, name: &StoreName) -> PathBuf {
        self.store_dir(name).join("store.db")
    }

    /// A store's config file.
    pub fn config_path(&self, name: &StoreName) -> PathBuf {
        self.store_dir(name).join("config.json")
    }

    /// A store's lineage record.
    pub fn lineage_path(&self, name: &StoreName) -> PathBuf {
        self.store_dir(name).join("lineage.json")
    }

    /// A store's derivation checkpoint directory.
    pub fn checkpoints_dir(&self, name: &StoreName) -> PathBuf {
        self.store_dir(name).join("checkpoints")
    }

    /// Derivation checkpoint for a `(target, source)` pair.
    pub fn derivation_checkpoint_path(&self, target: &StoreName, source: &StoreName) -> PathBuf {
        self.checkpoints_dir(target)
            .join(format!("{source}.json"))
    }

    /// Named filter directory.
    pub fn filters_dir(&self) -> PathBuf {
        self.0.join("filters")
    }

    /// A named filter file.
    pub fn filter_path(&self, name: &StoreName) -> PathBuf {
        self.filters_dir().join(format!("{name}.json"))
    }

    /// Advisory lock parent directory.
    pub fn locks_dir(&self) -> PathBuf {
        self.0.join("locks")
    }

    /// A store's advisory lock directory.
    pub fn lock_dir(&self, name: &StoreName) -> PathBuf {
        self.locks_dir().join(format!("store-{name}"))
    }

    /// Image cache root.
    pub fn images_dir(&self) -> PathBuf {
        self.0.join("images")
    }

    /// Identity resolver L1 cache database.
    pub fn identity_db_path(&self) -> PathBuf {
        self.0.join("identity.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_contract() {
        let root = StoreRoot::new("/tmp/.skygent");
        let name = StoreName::new("firehose").unwrap();
        assert_eq!(
            root.db_path(&name),
            PathBuf::from("/tmp/.skygent/stores/firehose/store.db")
        );
        assert_eq!(
            root.filter_path(&StoreName::new("tech").unwrap()),
            PathBuf::from("/tmp/.skygent/filters/tech.json")
        );
        assert_eq!(
            root.lock_dir(&name),
            PathBuf::from("/tmp/.skygent/locks/store-firehose")
        );
        let source = StoreName::new("src").unwrap();
        assert_eq!(
            root.derivation_checkpoint_path(&name, &source),
            PathBuf::from("/tmp/.skygent/stores/firehose/checkpoints/src.json")
        );
    }
}
