//! # skygent-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults** — [`Settings::default()`]
//! 2. **Settings file** — `<storeRoot>/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** — `SKYGENT_*` overrides (highest priority)
//!
//! Numeric knobs are clamped to their documented ranges at load time, so
//! the rest of the system never re-validates them.

#![deny(unsafe_code)]

pub mod loader;
pub mod types;

pub use loader::{deep_merge, load_settings, load_settings_from_root};
pub use types::{IdentitySettings, ImageSettings, OutputFormat, Settings, SyncSettings};

use std::sync::{Arc, RwLock};

/// Global settings singleton.
///
/// A `RwLock<Option<Arc<…>>>` rather than `OnceLock` so tests and a future
/// `settings update` path can swap the cached value. Reads are a shared
/// lock plus an `Arc::clone`.
static SETTINGS: RwLock<Option<Arc<Settings>>> = RwLock::new(None);

/// Get the global settings instance.
///
/// First call loads from `SKYGENT_STORE_ROOT` (or `./.skygent`) with env
/// overrides; later calls return the cached value. A load failure logs and
/// falls back to compiled defaults.
pub fn get_settings() -> Arc<Settings> {
    {
        let guard = SETTINGS.read().expect("settings lock poisoned");
        if let Some(ref s) = *guard {
            return Arc::clone(s);
        }
    }

    let mut guard = SETTINGS.write().expect("settings lock poisoned");
    if let Some(ref s) = *guard {
        return Arc::clone(s);
    }
    let settings = Arc::new(match load_settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load settings, using defaults");
            Settings::default()
        }
    });
    *guard = Some(Arc::clone(&settings));
    settings
}

/// Replace the cached settings (startup and tests).
pub fn init_settings(settings: Settings) {
    let mut guard = SETTINGS.write().expect("settings lock poisoned");
    *guard = Some(Arc::new(settings));
}
