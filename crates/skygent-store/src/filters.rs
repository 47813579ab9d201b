//! Named filter library.
//!
//! Filters live as `FilterExpr` JSON under `<storeRoot>/filters/<name>.json`.
//! Names share the `StoreName` grammar so they stay filesystem-safe. Every
//! save compiles the expression first — the library never persists a filter
//! the runtime would reject.

use skygent_core::ids::StoreName;
use skygent_filter::{FilterCompileError, FilterExpr, compile};

use crate::checkpoints::{read_json, write_json_atomic};
use crate::errors::{Result, StoreError};
use crate::paths::StoreRoot;

/// The named filter library.
pub struct FilterLibrary {
    root: StoreRoot,
}

impl FilterLibrary {
    /// Library over a root.
    pub fn new(root: StoreRoot) -> Self {
        Self { root }
    }

    /// Names of all saved filters, sorted.
    pub fn list(&self) -> Result<Vec<StoreName>> {
        let dir = self.root.filters_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if let Ok(name) = StoreName::new(stem) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load a named filter, `None` when absent.
    pub fn get(&self, name: &StoreName) -> Result<Option<FilterExpr>> {
        read_json(&self.root.filter_path(name))
    }

    /// Compile and persist a filter under a name.
    pub fn save(
        &self,
        name: &StoreName,
        expr: &FilterExpr,
    ) -> std::result::Result<(), SaveError> {
        let _ = compile(expr).map_err(SaveError::Compile)?;
        write_json_atomic(&self.root.filter_path(name), expr).map_err(SaveError::Store)
    }

    /// Remove a named filter. Returns whether one existed.
    pub fn remove(&self, name: &StoreName) -> Result<bool> {
        let path = self.root.filter_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Compile every saved filter and report per-name results.
    pub fn validate_all(
        &self,
    ) -> Result<Vec<(StoreName, std::result::Result<(), FilterCompileError>)>> {
        let mut results = Vec::new();
        for name in self.list()? {
            let verdict = match self.get(&name)? {
                Some(expr) => compile(&expr).map(|_| ()),
                None => Err(FilterCompileError {
                    message: "filter file disappeared during validation".into(),
                }),
            };
            results.push((name, verdict));
        }
        Ok(results)
    }
}

/// Failure saving a named filter.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// The expression does not compile.
    #[error(transparent)]
    Compile(FilterCompileError),
    /// The compiled expression could not be written.
    #[error(transparent)]
    Store(StoreError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use skygent_filter::ErrorPolicy;

    fn library() -> (tempfile::TempDir, FilterLibrary) {
        let dir = tempfile::tempdir().unwrap();
        let lib = FilterLibrary::new(StoreRoot::new(dir.path()));
        (dir, lib)
    }

    fn name(s: &str) -> StoreName {
        StoreName::new(s).unwrap()
    }

    #[test]
    fn save_get_list_remove() {
        let (_dir, lib) = library();
        let expr = FilterExpr::Contains {
            text: "rust".into(),
            case_sensitive: None,
        };
        lib.save(&name("tech"), &expr).unwrap();
        lib.save(&name("all"), &FilterExpr::All).unwrap();

        assert_eq!(lib.list().unwrap(), vec![name("all"), name("tech")]);
        assert_eq!(lib.get(&name("tech")).unwrap().unwrap(), expr);
        assert!(lib.get(&name("missing")).unwrap().is_none());

        assert!(lib.remove(&name("tech")).unwrap());
        assert!(!lib.remove(&name("tech")).unwrap());
    }

    #[test]
    fn save_rejects_invalid_filters() {
        let (_dir, lib) = library();
        let invalid = FilterExpr::Engagement {
            min_likes: None,
            min_reposts: None,
            min_replies: None,
        };
        assert!(matches!(
            lib.save(&name("bad"), &invalid),
            Err(SaveError::Compile(_))
        ));
        assert!(lib.list().unwrap().is_empty());
    }

    #[test]
    fn validate_all_flags_corrupted_entries() {
        let (dir, lib) = library();
        lib.save(&name("good"), &FilterExpr::All).unwrap();
        // Write an invalid expression behind the library's back.
        std::fs::write(
            dir.path().join("filters/bad.json"),
            serde_json::to_vec(&serde_json::json!({
                "_tag": "Regex", "patterns": ["(unclosed"],
            }))
            .unwrap(),
        )
        .unwrap();

        let results = lib.validate_all().unwrap();
        assert_eq!(results.len(), 2);
        let bad = results.iter().find(|(n, _)| n == &name("bad")).unwrap();
        assert!(bad.1.is_err());
        let good = results.iter().find(|(n, _)| n == &name("good")).unwrap();
        assert!(good.1.is_ok());
    }

    #[test]
    fn round_trips_effectful_filters() {
        let (_dir, lib) = library();
        let expr = FilterExpr::HasValidLinks {
            on_error: ErrorPolicy::Retry {
                max_retries: 2,
                base_delay_ms: 100,
            },
        };
        lib.save(&name("links"), &expr).unwrap();
        assert_eq!(lib.get(&name("links")).unwrap().unwrap(), expr);
    }
}
