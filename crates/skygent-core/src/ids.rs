//! Branded primitive types and the monotonic event-id generator.
//!
//! Every identifier that crosses a crate boundary is a validating newtype:
//! construction goes through `new`, which rejects malformed input, so the
//! rest of the system never re-validates. All of them serialize as plain
//! strings for wire compatibility.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::errors::IdError;

/// Lowercase DNS-like handle, e.g. `alice.bsky.social`.
///
/// Normalized to lowercase at construction. At least two dot-separated
/// labels of `[a-z0-9-]`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Parse and normalize a handle.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdError> {
        let normalized = raw.as_ref().trim().trim_start_matches('@').to_lowercase();
        let labels: Vec<&str> = normalized.split('.').collect();
        let valid = labels.len() >= 2
            && labels.iter().all(|label| {
                !label.is_empty()
                    && label
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            });
        if !valid {
            return Err(IdError::InvalidHandle(raw.as_ref().to_string()));
        }
        Ok(Self(normalized))
    }

    /// The handle as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decentralized identifier, e.g. `did:plc:abc123`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    /// Parse a DID. Must carry the `did:` scheme and a method-specific id.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdError> {
        let s = raw.as_ref().trim();
        let rest = s
            .strip_prefix("did:")
            .ok_or_else(|| IdError::InvalidDid(s.to_string()))?;
        if rest.is_empty() || !rest.contains(':') {
            return Err(IdError::InvalidDid(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The DID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `#hashtag`, normalized to lowercase (Bluesky tags match
/// case-insensitively).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hashtag(String);

impl Hashtag {
    /// Parse a hashtag. A bare word is accepted and gains its `#` prefix.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdError> {
        let trimmed = raw.as_ref().trim();
        let body = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if body.is_empty() || body.chars().any(char::is_whitespace) {
            return Err(IdError::InvalidHashtag(raw.as_ref().to_string()));
        }
        Ok(Self(format!("#{}", body.to_lowercase())))
    }

    /// The hashtag including its `#` prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The tag without the `#` prefix.
    pub fn bare(&self) -> &str {
        &self.0[1..]
    }
}

impl fmt::Display for Hashtag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// AT-URI of a post record: `at://<did>/app.bsky.feed.post/<rkey>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostUri(String);

/// The collection NSID every post record lives in.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

impl PostUri {
    /// Parse an AT-URI pointing at a post record.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdError> {
        let s = raw.as_ref().trim();
        let rest = s
            .strip_prefix("at://")
            .ok_or_else(|| IdError::InvalidPostUri(s.to_string()))?;
        let mut parts = rest.splitn(3, '/');
        let authority = parts.next().unwrap_or_default();
        let collection = parts.next().unwrap_or_default();
        let rkey = parts.next().unwrap_or_default();
        if authority.is_empty() || collection != POST_COLLECTION || rkey.is_empty() {
            return Err(IdError::InvalidPostUri(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The URI as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The authority segment (a DID or handle).
    pub fn authority(&self) -> &str {
        self.0["at://".len()..]
            .split('/')
            .next()
            .unwrap_or_default()
    }

    /// The record key (last path segment).
    pub fn rkey(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for PostUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store name — a filesystem-safe identifier.
///
/// `[A-Za-z0-9._-]`, non-empty, no leading dot, at most 64 chars. Used as a
/// directory name under `<storeRoot>/stores/`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreName(String);

impl StoreName {
    /// Parse a store name.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdError> {
        let s = raw.as_ref().trim();
        let valid = !s.is_empty()
            && s.len() <= 64
            && !s.starts_with('.')
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(IdError::InvalidStoreName(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Event id — a 26-char ULID. Lexicographic order is append order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Ulid);

impl EventId {
    /// Parse from the canonical 26-char Crockford base32 form.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|_| IdError::InvalidEventId(raw.to_string()))
    }

    /// Milliseconds-since-epoch component.
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    /// The underlying ULID.
    pub fn ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic ULID generator.
///
/// INVARIANT: ids strictly increase in generation order, even when the
/// clock stalls or steps backwards. Within one millisecond the 80-bit
/// random component is incremented; on overflow the carry moves into the
/// next millisecond with a zeroed random component.
///
/// One generator exists per store, guarded by the store's write lock.
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    last: Option<(u64, u128)>,
}

const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1 << RANDOM_BITS) - 1;

impl EventIdGenerator {
    /// Create a fresh generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a previously persisted id so restarts stay monotone.
    pub fn seeded(last: EventId) -> Self {
        let ulid = last.ulid();
        Self {
            last: Some((ulid.timestamp_ms(), ulid.random())),
        }
    }

    /// Generate the next id using the system clock.
    pub fn next(&mut self) -> EventId {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.next_at(now_ms)
    }

    /// Generate the next id for an explicit clock reading (test seam).
    pub fn next_at(&mut self, now_ms: u64) -> EventId {
        let (t, random) = match self.last {
            Some((last_t, last_random)) if now_ms <= last_t => {
                if last_random >= RANDOM_MASK {
                    (last_t + 1, 0)
                } else {
                    (last_t, last_random + 1)
                }
            }
            _ => (now_ms, rand::random::<u128>() & RANDOM_MASK),
        };
        self.last = Some((t, random));
        EventId(Ulid::from_parts(t, random))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn handle_normalizes() {
        let h = Handle::new("@Alice.Bsky.Social").unwrap();
        assert_eq!(h.as_str(), "alice.bsky.social");
    }

    #[test]
    fn handle_rejects_single_label() {
        assert!(Handle::new("alice").is_err());
        assert!(Handle::new("").is_err());
        assert!(Handle::new("a..b").is_err());
        assert!(Handle::new("a b.c").is_err());
    }

    #[test]
    fn did_requires_scheme_and_method() {
        assert!(Did::new("did:plc:abc123").is_ok());
        assert!(Did::new("did:web:example.com").is_ok());
        assert!(Did::new("plc:abc123").is_err());
        assert!(Did::new("did:").is_err());
        assert!(Did::new("did:plc").is_err());
    }

    #[test]
    fn hashtag_normalizes_and_prefixes() {
        assert_eq!(Hashtag::new("#Rust").unwrap().as_str(), "#rust");
        assert_eq!(Hashtag::new("rust").unwrap().as_str(), "#rust");
        assert_eq!(Hashtag::new("#rust").unwrap().bare(), "rust");
        assert!(Hashtag::new("#").is_err());
        assert!(Hashtag::new("# spaced").is_err());
    }

    #[test]
    fn post_uri_parses_segments() {
        let uri = PostUri::new("at://did:plc:abc/app.bsky.feed.post/3k2aaa").unwrap();
        assert_eq!(uri.authority(), "did:plc:abc");
        assert_eq!(uri.rkey(), "3k2aaa");
    }

    #[test]
    fn post_uri_rejects_other_collections() {
        assert!(PostUri::new("at://did:plc:abc/app.bsky.feed.like/3k2aaa").is_err());
        assert!(PostUri::new("https://example.com").is_err());
        assert!(PostUri::new("at://did:plc:abc").is_err());
    }

    #[test]
    fn store_name_rules() {
        assert!(StoreName::new("tech-news").is_ok());
        assert!(StoreName::new("a.b_c-1").is_ok());
        assert!(StoreName::new("").is_err());
        assert!(StoreName::new(".hidden").is_err());
        assert!(StoreName::new("has space").is_err());
        assert!(StoreName::new("x".repeat(65)).is_err());
    }

    #[test]
    fn event_id_round_trips() {
        let mut g = EventIdGenerator::new();
        let id = g.next_at(1_700_000_000_000);
        let parsed = EventId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_string().len(), 26);
    }

    #[test]
    fn same_millisecond_increments_random() {
        let mut g = EventIdGenerator::new();
        let a = g.next_at(1000);
        let b = g.next_at(1000);
        assert!(b > a);
        assert_eq!(a.timestamp_ms(), b.timestamp_ms());
        assert_eq!(b.ulid().random(), a.ulid().random() + 1);
    }

    #[test]
    fn clock_step_back_reuses_last_ms() {
        let mut g = EventIdGenerator::new();
        let a = g.next_at(2000);
        let b = g.next_at(1000);
        assert!(b > a);
        assert_eq!(b.timestamp_ms(), 2000);
    }

    #[test]
    fn random_overflow_carries_into_next_ms() {
        let mut g = EventIdGenerator {
            last: Some((1000, RANDOM_MASK)),
        };
        let id = g.next_at(1000);
        assert_eq!(id.timestamp_ms(), 1001);
        assert_eq!(id.ulid().random(), 0);
    }

    #[test]
    fn seeded_generator_stays_monotone() {
        let mut g = EventIdGenerator::new();
        let last = g.next_at(5000);
        let mut resumed = EventIdGenerator::seeded(last);
        let next = resumed.next_at(4000);
        assert!(next > last);
    }

    proptest! {
        #[test]
        fn ids_strictly_increase(timestamps in proptest::collection::vec(0u64..=1u64 << 40, 1..200)) {
            let mut g = EventIdGenerator::new();
            let mut prev: Option<EventId> = None;
            for t in timestamps {
                let id = g.next_at(t);
                if let Some(p) = prev {
                    prop_assert!(id > p);
                }
                prev = Some(id);
            }
        }

        #[test]
        fn lexicographic_order_matches_ulid_order(t1 in 0u64..=1u64 << 40, t2 in 0u64..=1u64 << 40) {
            let mut g = EventIdGenerator::new();
            let a = g.next_at(t1);
            let b = g.next_at(t2);
            prop_assert_eq!(a.to_string() < b.to_string(), a < b);
        }
    }
}
