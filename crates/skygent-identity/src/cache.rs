//! The two cache tiers.

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use skygent_core::ids::{Did, Handle};

use crate::errors::IdentityError;

/// Where a cached identity record came from. `ResolveIdentity` records are
/// authoritative; the others are opportunistic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheSource {
    /// The authoritative identity endpoint.
    ResolveIdentity,
    /// A batched `getProfiles` response.
    GetProfiles,
    /// Seen in passing (post author fields, mentions).
    Observation,
}

impl CacheSource {
    /// Column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResolveIdentity => "resolveIdentity",
            Self::GetProfiles => "getProfiles",
            Self::Observation => "observation",
        }
    }

    /// Whether records from this source are authoritative.
    pub fn verified(self) -> bool {
        matches!(self, Self::ResolveIdentity)
    }
}

/// L1: persistent DID↔handle map at `<storeRoot>/identity.db`.
pub struct IdentityCacheDb {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identity_cache (
    did        TEXT PRIMARY KEY,
    handle     TEXT NOT NULL,
    verified   INTEGER NOT NULL DEFAULT 0,
    source     TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_identity_handle ON identity_cache(handle);
";

impl IdentityCacheDb {
    /// Open (or create) the cache database.
    pub fn open(path: &Path) -> Result<Self, IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IdentityError::Cache(format!("mkdir {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory cache for tests.
    pub fn open_in_memory() -> Result<Self, IdentityError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// `did → handle`, with the verified bit.
    pub fn lookup_handle(&self, did: &Did) -> Result<Option<(Handle, bool)>, IdentityError> {
        let conn = self.conn.lock();
        let row: Option<(String, bool)> = conn
            .query_row(
                "SELECT handle, verified FROM identity_cache WHERE did = ?1",
                params![did.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(handle, verified)| {
            Handle::new(handle)
                .map(|h| (h, verified))
                .map_err(|e| IdentityError::Cache(e.to_string()))
        })
        .transpose()
    }

    /// `handle → did`.
    pub fn lookup_did(&self, handle: &Handle) -> Result<Option<Did>, IdentityError> {
        let conn = self.conn.lock();
        let row: Option<String> = conn
            .query_row(
                "SELECT did FROM identity_cache WHERE handle = ?1 ORDER BY verified DESC LIMIT 1",
                params![handle.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        row.map(|did| Did::new(did).map_err(|e| IdentityError::Cache(e.to_string())))
            .transpose()
    }

    /// Record a mapping. An unverified write never downgrades a verified
    /// record.
    pub fn record(
        &self,
        did: &Did,
        handle: &Handle,
        source: CacheSource,
    ) -> Result<(), IdentityError> {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO identity_cache (did, handle, verified, source, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(did) DO UPDATE SET
                 handle = excluded.handle,
                 verified = excluded.verified,
                 source = excluded.source,
                 updated_at = excluded.updated_at
             WHERE excluded.verified >= identity_cache.verified",
            params![
                did.as_str(),
                handle.as_str(),
                source.verified(),
                source.as_str(),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Number of cached identities.
    pub fn len(&self) -> Result<u64, IdentityError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM identity_cache", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> Result<bool, IdentityError> {
        Ok(self.len()? == 0)
    }
}

/// L2: in-memory LRU of `did → handle` with per-entry TTL.
pub struct RequestCache {
    entries: Mutex<LruCache<String, (Handle, Instant)>>,
    ttl: Duration,
}

impl RequestCache {
    /// Cache with the given capacity and TTL.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Fresh hit or nothing. Expired entries are evicted on access.
    pub fn get(&self, did: &Did) -> Option<Handle> {
        let mut entries = self.entries.lock();
        match entries.get(did.as_str()) {
            Some((handle, inserted)) if inserted.elapsed() < self.ttl => Some(handle.clone()),
            Some(_) => {
                let _ = entries.pop(did.as_str());
                None
            }
            None => None,
        }
    }

    /// Insert a mapping.
    pub fn put(&self, did: &Did, handle: Handle) {
        let _ = self
            .entries
            .lock()
            .put(did.as_str().to_string(), (handle, Instant::now()));
    }

    /// Current entry count (expired entries included until touched).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
