//! Derivation checkpoint persistence.
//!
//! One JSON file per `(target, source)` pair under
//! `stores/<target>/checkpoints/<source>.json`, written atomically
//! (temp file + rename) with last-write-wins semantics.

use std::path::Path;

use tracing::debug;

use skygent_core::ids::StoreName;

use crate::errors::{Result, StoreError};
use crate::paths::StoreRoot;
use crate::types::DerivationCheckpoint;

/// Write a JSON value atomically: temp file in the same directory, then
/// rename over the destination.
pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::index(format!("path has no parent: {}", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value).map_err(|e| StoreError::json_at(path, e))?;
    std::fs::write(&tmp, body).map_err(|e| StoreError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// Read a JSON file, `None` when absent.
pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let value = serde_json::from_slice(&raw).map_err(|e| StoreError::json_at(path, e))?;
    Ok(Some(value))
}

/// Disk K-V for derivation checkpoints, keyed by `(target, source)`.
pub struct DerivationCheckpointStore {
    root: StoreRoot,
}

impl DerivationCheckpointStore {
    /// Store over a root.
    pub fn new(root: StoreRoot) -> Self {
        Self { root }
    }

    /// Load a checkpoint, `None` when the pair has never been derived.
    pub fn load(
        &self,
        target: &StoreName,
        source: &StoreName,
    ) -> Result<Option<DerivationCheckpoint>> {
        read_json(&self.root.derivation_checkpoint_path(target, source))
    }

    /// Upsert a checkpoint (last write wins).
    pub fn save(&self, checkpoint: &DerivationCheckpoint) -> Result<()> {
        let path = self
            .root
            .derivation_checkpoint_path(&checkpoint.target_store, &checkpoint.source_store);
        write_json_atomic(&path, checkpoint)?;
        debug!(
            target = %checkpoint.target_store,
            source = %checkpoint.source_store,
            last = ?checkpoint.last_source_event_id,
            "derivation checkpoint saved"
        );
        Ok(())
    }

    /// Remove a checkpoint. Returns whether one existed.
    pub fn remove(&self, target: &StoreName, source: &StoreName) -> Result<bool> {
        let path = self.root.derivation_checkpoint_path(target, source);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// All checkpoints of one target store.
    pub fn list_for(&self, target: &StoreName) -> Result<Vec<DerivationCheckpoint>> {
        let dir = self.root.checkpoints_dir(target);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut checkpoints = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(cp) = read_json::<DerivationCheckpoint>(&path)? {
                checkpoints.push(cp);
            }
        }
        checkpoints.sort_by(|a, b| a.source_store.cmp(&b.source_store));
        Ok(checkpoints)
    }

    /// Rewrite every checkpoint referencing `old` (as source or target)
    /// after a store rename. `all_stores` names the surviving stores.
    pub fn rename_store(
        &self,
        old: &StoreName,
        new: &StoreName,
        all_stores: &[StoreName],
    ) -> Result<()> {
        for target in all_stores {
            for mut cp in self.list_for(target)? {
                let mut touched = false;
                if cp.source_store == *old {
                    let _ = self.remove(target, old)?;
                    cp.source_store = new.clone();
                    touched = true;
                }
                if cp.target_store == *old {
                    cp.target_store = new.clone();
                    cp.view_name = new.clone();
                    touched = true;
                }
                if touched {
                    self.save(&cp)?;
                }
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::types::EvaluationMode;

    fn name(s: &str) -> StoreName {
        StoreName::new(s).unwrap()
    }

    fn checkpoint(target: &str, source: &str) -> DerivationCheckpoint {
        DerivationCheckpoint {
            view_name: name(target),
            source_store: name(source),
            target_store: name(target),
            filter_hash: "hash".into(),
            evaluation_mode: EvaluationMode::EventTime,
            last_source_event_id: None,
            events_processed: 10,
            events_matched: 4,
            deletes_propagated: 1,
            updated_at: "2026-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = DerivationCheckpointStore::new(StoreRoot::new(dir.path()));
        let cp = checkpoint("tgt", "src");

        assert!(store.load(&name("tgt"), &name("src")).unwrap().is_none());
        store.save(&cp).unwrap();
        assert_eq!(store.load(&name("tgt"), &name("src")).unwrap().unwrap(), cp);

        assert!(store.remove(&name("tgt"), &name("src")).unwrap());
        assert!(!store.remove(&name("tgt"), &name("src")).unwrap());
    }

    #[test]
    fn last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = DerivationCheckpointStore::new(StoreRoot::new(dir.path()));
        let mut cp = checkpoint("tgt", "src");
        store.save(&cp).unwrap();
        cp.events_processed = 99;
        store.save(&cp).unwrap();
        assert_eq!(
            store
                .load(&name("tgt"), &name("src"))
                .unwrap()
                .unwrap()
                .events_processed,
            99
        );
        assert_eq!(store.list_for(&name("tgt")).unwrap().len(), 1);
    }

    #[test]
    fn rename_rewrites_source_references() {
        let dir = tempfile::tempdir().unwrap();
        let store = DerivationCheckpointStore::new(StoreRoot::new(dir.path()));
        store.save(&checkpoint("tgt", "old-src")).unwrap();

        store
            .rename_store(&name("old-src"), &name("new-src"), &[name("tgt")])
            .unwrap();
        assert!(store.load(&name("tgt"), &name("old-src")).unwrap().is_none());
        let renamed = store.load(&name("tgt"), &name("new-src")).unwrap().unwrap();
        assert_eq!(renamed.source_store, name("new-src"));
    }
}
