//! Settings shapes and compiled defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default CLI output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Machine-readable JSON (default).
    #[default]
    Json,
    /// Human tables and cards.
    Text,
}

/// Identity resolver knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentitySettings {
    /// Profiles per batched request, clamped to `1..=25`.
    pub profile_batch_size: usize,
    /// L2 request-cache capacity.
    pub profile_cache_capacity: usize,
    /// L2 request-cache TTL in seconds.
    pub profile_cache_ttl_secs: u64,
    /// Resolve every DID via the authoritative identity endpoint.
    pub strict: bool,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            profile_batch_size: 25,
            profile_cache_capacity: 5000,
            profile_cache_ttl_secs: 6 * 60 * 60,
            strict: false,
        }
    }
}

impl IdentitySettings {
    /// L2 TTL as a `Duration`.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.profile_cache_ttl_secs)
    }
}

/// Image cache knobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageSettings {
    /// Whether the cache is active at all.
    pub enabled: bool,
    /// Hard cap on fetched image bytes.
    pub fetch_max_bytes: u64,
    /// Coalescing window for concurrent fetches, in milliseconds.
    pub fetch_batch_window_ms: u64,
    /// Concurrent fetches.
    pub fetch_concurrency: usize,
    /// Positive cache TTL in seconds.
    pub cache_ttl_secs: u64,
    /// Negative (failure) cache TTL in seconds.
    pub failure_ttl_secs: u64,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fetch_max_bytes: 10 * 1024 * 1024,
            fetch_batch_window_ms: 0,
            fetch_concurrency: 4,
            cache_ttl_secs: 7 * 24 * 60 * 60,
            failure_ttl_secs: 10 * 60,
        }
    }
}

impl ImageSettings {
    /// Positive TTL as a `Duration`.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Failure TTL as a `Duration`.
    pub fn failure_ttl(&self) -> Duration {
        Duration::from_secs(self.failure_ttl_secs)
    }
}

/// Sync/derivation checkpoint cadence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Checkpoint after this many events (≥ 1).
    pub derivation_checkpoint_every: u64,
    /// Checkpoint after this many milliseconds (≥ 0).
    pub derivation_checkpoint_interval_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            derivation_checkpoint_every: 100,
            derivation_checkpoint_interval_ms: 5000,
        }
    }
}

impl SyncSettings {
    /// Checkpoint interval as a `Duration`.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.derivation_checkpoint_interval_ms)
    }
}

/// The full settings tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Store root directory.
    pub store_root: Option<PathBuf>,
    /// Default output format.
    pub output_format: OutputFormat,
    /// Identity resolver.
    pub identity: IdentitySettings,
    /// Image cache.
    pub images: ImageSettings,
    /// Sync/derivation cadence.
    pub sync: SyncSettings,
}

impl Settings {
    /// The effective store root (`./.skygent` unless configured).
    pub fn store_root(&self) -> PathBuf {
        self.store_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("./.skygent"))
    }

    /// Clamp every numeric knob into its documented range.
    pub fn clamped(mut self) -> Self {
        self.identity.profile_batch_size = self.identity.profile_batch_size.clamp(1, 25);
        self.identity.profile_cache_capacity = self.identity.profile_cache_capacity.max(1);
        self.sync.derivation_checkpoint_every = self.sync.derivation_checkpoint_every.max(1);
        self.images.fetch_concurrency = self.images.fetch_concurrency.max(1);
        self
    }
}
