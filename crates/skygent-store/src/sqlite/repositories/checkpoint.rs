//! Sync checkpoint repository.
//!
//! One row per source key, last-write-wins. The checkpoint pins the filter
//! signature so a changed filter restarts ingestion instead of resuming
//! mid-stream with different semantics.

use rusqlite::{Connection, OptionalExtension, params};

use skygent_core::ids::EventId;

use crate::errors::{Result, StoreError};
use crate::types::SyncCheckpoint;

/// Sync checkpoint repository — stateless, every method takes `&Connection`.
pub struct CheckpointRepo;

impl CheckpointRepo {
    /// Load the checkpoint for a source key.
    pub fn load(conn: &Connection, source: &str) -> Result<Option<SyncCheckpoint>> {
        let row = conn
            .query_row(
                "SELECT source, cursor, filter_hash, last_event_id, updated_at
                 FROM sync_checkpoint WHERE source = ?1",
                params![source],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(source, cursor, filter_hash, last_event_id, updated_at)| {
            Ok(SyncCheckpoint {
                source,
                cursor,
                filter_hash,
                last_event_id: last_event_id
                    .map(|r| EventId::parse(&r).map_err(StoreError::Corrupt))
                    .transpose()?,
                updated_at: updated_at
                    .parse()
                    .map_err(|e| StoreError::index(format!("bad checkpoint timestamp: {e}")))?,
            })
        })
        .transpose()
    }

    /// Upsert a checkpoint (last write wins).
    pub fn save(conn: &Connection, checkpoint: &SyncCheckpoint) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sync_checkpoint (source, cursor, filter_hash, last_event_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source) DO UPDATE SET
                 cursor = excluded.cursor,
                 filter_hash = excluded.filter_hash,
                 last_event_id = excluded.last_event_id,
                 updated_at = excluded.updated_at",
            params![
                checkpoint.source,
                checkpoint.cursor,
                checkpoint.filter_hash,
                checkpoint.last_event_id.map(|id| id.to_string()),
                checkpoint.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Remove the checkpoint for a source key. Returns whether one existed.
    pub fn remove(conn: &Connection, source: &str) -> Result<bool> {
        let changed = conn.execute(
            "DELETE FROM sync_checkpoint WHERE source = ?1",
            params![source],
        )?;
        Ok(changed > 0)
    }

    /// All checkpoints of this store.
    pub fn list(conn: &Connection) -> Result<Vec<SyncCheckpoint>> {
        let mut stmt =
            conn.prepare("SELECT source FROM sync_checkpoint ORDER BY source ASC")?;
        let sources: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        sources
            .iter()
            .filter_map(|s| Self::load(conn, s).transpose())
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
