//! Event log repository — the append-only source of truth.
//!
//! Rows are keyed by ULID event id; lexicographic order over the id column
//! IS append order. `event_log_meta.last_event_id` mirrors the maximum id
//! so readers can learn the head without a table scan.

use rusqlite::{Connection, OptionalExtension, params};

use skygent_core::event::EventRecord;
use skygent_core::ids::EventId;

use crate::errors::{Result, StoreError};
use crate::sqlite::schema::META_LAST_EVENT_ID;

/// Page size used by [`EventLogRepo::page_after`].
pub const STREAM_PAGE_SIZE: usize = 500;

/// Event log repository — stateless, every method takes `&Connection`.
pub struct EventLogRepo;

impl EventLogRepo {
    /// Insert a record and advance `last_event_id`. Caller supplies the
    /// transaction scope.
    pub fn insert(conn: &Connection, record: &EventRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let meta = record.event.meta();
        let _ = conn.execute(
            "INSERT INTO event_log (event_id, event_type, post_uri, payload_json, created_at, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.to_string(),
                record.event.type_name(),
                record.event.uri().as_str(),
                payload,
                meta.created_at.to_rfc3339(),
                meta.source,
            ],
        )?;
        let _ = conn.execute(
            "INSERT INTO event_log_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![META_LAST_EVENT_ID, record.id.to_string()],
        )?;
        Ok(())
    }

    /// One ascending page of records strictly after `cursor`.
    pub fn page_after(
        conn: &Connection,
        cursor: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let after = cursor.map(ToString::to_string).unwrap_or_default();
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM event_log
             WHERE event_id > ?1
             ORDER BY event_id ASC
             LIMIT ?2",
        )?;
        let payloads: Vec<String> = stmt
            .query_map(params![after, limit as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        payloads.iter().map(|p| Self::decode(p)).collect()
    }

    /// Count all events.
    pub fn count(conn: &Connection) -> Result<u64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM event_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Count `PostUpsert` events.
    pub fn count_upserts(conn: &Connection) -> Result<u64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE event_type = 'PostUpsert'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// The recorded head, falling back to `MAX(event_id)` when the meta row
    /// is missing. `None` on an empty log.
    pub fn last_event_id(conn: &Connection) -> Result<Option<EventId>> {
        let from_meta: Option<String> = conn
            .query_row(
                "SELECT value FROM event_log_meta WHERE key = ?1",
                params![META_LAST_EVENT_ID],
                |row| row.get(0),
            )
            .optional()?;
        let raw = match from_meta {
            Some(raw) => Some(raw),
            None => conn
                .query_row("SELECT MAX(event_id) FROM event_log", [], |row| row.get(0))
                .optional()?
                .flatten(),
        };
        raw.map(|r| EventId::parse(&r).map_err(StoreError::Corrupt))
            .transpose()
    }

    /// Delete every event and all meta rows. Caller supplies the
    /// transaction scope.
    pub fn clear(conn: &Connection) -> Result<()> {
        let _ = conn.execute("DELETE FROM event_log", [])?;
        let _ = conn.execute("DELETE FROM event_log_meta", [])?;
        Ok(())
    }

    fn decode(payload: &str) -> Result<EventRecord> {
        serde_json::from_str(payload).map_err(|e| StoreError::Json {
            path: None,
            source: e,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
