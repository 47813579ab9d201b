//! Lineage records for derived stores.
//!
//! `stores/<name>/lineage.json` lists every source a derived store was
//! replayed from, the exact filter used (expression + signature), and the
//! evaluation mode. Staleness detection and `store tree` rendering read
//! these records.

use tracing::debug;

use skygent_core::Timestamp;
use skygent_core::ids::StoreName;

use crate::checkpoints::{read_json, write_json_atomic};
use crate::errors::{Result, StoreError};
use crate::paths::StoreRoot;
use crate::types::{LineageSource, StoreLineage};

/// K-V of lineage records, keyed by store name.
pub struct LineageStore {
    root: StoreRoot,
}

impl LineageStore {
    /// Store over a root.
    pub fn new(root: StoreRoot) -> Self {
        Self { root }
    }

    /// Load a store's lineage, `None` for source stores.
    pub fn get(&self, name: &StoreName) -> Result<Option<StoreLineage>> {
        read_json(&self.root.lineage_path(name))
    }

    /// Write a lineage record.
    pub fn save(&self, lineage: &StoreLineage) -> Result<()> {
        write_json_atomic(&self.root.lineage_path(&lineage.store_name), lineage)?;
        debug!(store = %lineage.store_name, sources = lineage.sources.len(), "lineage saved");
        Ok(())
    }

    /// Remove a lineage record. Returns whether one existed.
    pub fn remove(&self, name: &StoreName) -> Result<bool> {
        let path = self.root.lineage_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Merge one source entry into a store's lineage, creating the record
    /// on first derivation. An existing entry for the same source store is
    /// replaced.
    pub fn upsert_source(
        &self,
        target: &StoreName,
        source: LineageSource,
        now: Timestamp,
    ) -> Result<StoreLineage> {
        let mut lineage = self.get(target)?.unwrap_or(StoreLineage {
            store_name: target.clone(),
            is_derived: true,
            sources: Vec::new(),
            updated_at: now,
        });
        lineage
            .sources
            .retain(|s| s.store_name != source.store_name);
        lineage.sources.push(source);
        lineage.sources.sort_by(|a, b| a.store_name.cmp(&b.store_name));
        lineage.updated_at = now;
        self.save(&lineage)?;
        Ok(lineage)
    }

    /// All lineage records under the root.
    pub fn list(&self) -> Result<Vec<StoreLineage>> {
        let stores_dir = self.root.stores_dir();
        if !stores_dir.exists() {
            return Ok(Vec::new());
        }
        let mut lineages = Vec::new();
        for entry in std::fs::read_dir(&stores_dir).map_err(|e| StoreError::io(&stores_dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&stores_dir, e))?;
            let Ok(name) = StoreName::new(entry.file_name().to_string_lossy()) else {
                continue;
            };
            if let Some(lineage) = self.get(&name)? {
                lineages.push(lineage);
            }
        }
        lineages.sort_by(|a, b| a.store_name.cmp(&b.store_name));
        Ok(lineages)
    }

    /// Rewrite every record that references `old` after a store rename:
    /// the renamed store's own record plus every record listing it as a
    /// source.
    pub fn rename_store(&self, old: &StoreName, new: &StoreName) -> Result<()> {
        for mut lineage in self.list()? {
            let mut touched = false;
            if lineage.store_name == *old {
                lineage.store_name = new.clone();
                touched = true;
            }
            for source in &mut lineage.sources {
                if source.store_name == *old {
                    source.store_name = new.clone();
                    touched = true;
                }
            }
            if touched {
                self.save(&lineage)?;
            }
        }
        // A record left at the old path (pre-rename write) is gone now that
        // the directory moved; nothing else to clean.
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
