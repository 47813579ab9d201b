//! Store events and the [`EventRecord`] wire envelope.
//!
//! Events are the only thing written to a store's append-only log. They are
//! created by the sync or derivation engine and never mutated. The envelope
//! carries a `version` field — the wire-format version, not the post
//! version — so future readers can dispatch on shape.

use serde::{Deserialize, Serialize};

use crate::Timestamp;
use crate::ids::{EventId, PostUri, StoreName};
use crate::post::Post;

/// Wire-format version written into every [`EventRecord`].
pub const EVENT_RECORD_VERSION: u32 = 1;

/// Provenance metadata attached to every event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    /// Which source produced the event (a source key or `"derive"`).
    pub source: String,
    /// CLI command that triggered the write, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// When the event was created.
    pub created_at: Timestamp,
    /// Source store, for events replayed by derivation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_store: Option<StoreName>,
}

impl EventMeta {
    /// Meta for a freshly ingested event.
    pub fn now(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            command: None,
            created_at: chrono::Utc::now(),
            source_store: None,
        }
    }
}

/// A store event — closed tagged union.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum Event {
    /// A post snapshot was added (or refreshed).
    PostUpsert {
        /// The post snapshot.
        post: Post,
        /// Provenance.
        meta: EventMeta,
    },
    /// A post was deleted upstream.
    PostDelete {
        /// URI of the deleted post.
        uri: PostUri,
        /// Provenance.
        meta: EventMeta,
    },
}

impl Event {
    /// The post URI this event is about.
    pub fn uri(&self) -> &PostUri {
        match self {
            Self::PostUpsert { post, .. } => &post.uri,
            Self::PostDelete { uri, .. } => uri,
        }
    }

    /// Provenance metadata.
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::PostUpsert { meta, .. } | Self::PostDelete { meta, .. } => meta,
        }
    }

    /// Mutable provenance metadata (derivation stamps `source_store`).
    pub fn meta_mut(&mut self) -> &mut EventMeta {
        match self {
            Self::PostUpsert { meta, .. } | Self::PostDelete { meta, .. } => meta,
        }
    }

    /// Discriminator string as stored in the `event_type` column.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::PostUpsert { .. } => "PostUpsert",
            Self::PostDelete { .. } => "PostDelete",
        }
    }

    /// Whether this is an upsert.
    pub fn is_upsert(&self) -> bool {
        matches!(self, Self::PostUpsert { .. })
    }
}

/// The persisted envelope: `{id, version, event}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Event id (ULID, append-ordered).
    pub id: EventId,
    /// Wire-format version.
    pub version: u32,
    /// The event itself.
    pub event: Event,
}

impl EventRecord {
    /// Wrap an event under a freshly generated id.
    pub fn new(id: EventId, event: Event) -> Self {
        Self {
            id,
            version: EVENT_RECORD_VERSION,
            event,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::ids::{EventIdGenerator, Handle};

    fn upsert(uri: &str) -> Event {
        Event::PostUpsert {
            post: Post {
                uri: PostUri::new(uri).unwrap(),
                cid: None,
                author: Handle::new("alice.test").unwrap(),
                author_did: None,
                text: "hi".into(),
                created_at: "2026-01-01T00:00:00Z".parse().unwrap(),
                hashtags: Default::default(),
                mentions: Vec::new(),
                mention_dids: Vec::new(),
                links: Vec::new(),
                reply: None,
                embed: None,
                metrics: None,
                facets: None,
                langs: Vec::new(),
                tags: Vec::new(),
                self_labels: Vec::new(),
                labels: Vec::new(),
                indexed_at: None,
                feed: None,
            },
            meta: EventMeta {
                source: "timeline".into(),
                command: None,
                created_at: "2026-01-01T00:00:01Z".parse().unwrap(),
                source_store: None,
            },
        }
    }

    #[test]
    fn record_envelope_round_trip() {
        let mut g = EventIdGenerator::new();
        let record = EventRecord::new(g.next_at(1000), upsert("at://did:plc:a/app.bsky.feed.post/1"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["event"]["_tag"], "PostUpsert");
        assert_eq!(json["id"].as_str().unwrap().len(), 26);

        let back: EventRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn delete_event_shape() {
        let event = Event::PostDelete {
            uri: PostUri::new("at://did:plc:a/app.bsky.feed.post/1").unwrap(),
            meta: EventMeta::now("timeline"),
        };
        assert_eq!(event.type_name(), "PostDelete");
        assert!(!event.is_upsert());
        assert_eq!(event.uri().rkey(), "1");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["_tag"], "PostDelete");
        assert!(json["meta"].get("sourceStore").is_none());
    }

    #[test]
    fn derivation_stamps_source_store() {
        let mut event = upsert("at://did:plc:a/app.bsky.feed.post/1");
        event.meta_mut().source_store = Some(StoreName::new("firehose").unwrap());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["meta"]["sourceStore"], "firehose");
    }
}
