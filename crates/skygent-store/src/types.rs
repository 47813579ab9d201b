//! Shared store-layer value types: checkpoints, lineage, stats, queries.

use serde::{Deserialize, Serialize};

use skygent_core::Timestamp;
use skygent_core::ids::{EventId, Handle, Hashtag, StoreName};
use skygent_filter::FilterExpr;

/// How a derivation evaluates its filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationMode {
    /// Pure filters only; deterministic replay.
    EventTime,
    /// Effectful filters allowed; results depend on derive time.
    DeriveTime,
}

impl std::fmt::Display for EvaluationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::EventTime => "EventTime",
            Self::DeriveTime => "DeriveTime",
        })
    }
}

/// Durable position of a sync run, keyed by `(store, source)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    /// Canonical source key.
    pub source: String,
    /// Page cursor to resume from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Signature of the filter this run used.
    pub filter_hash: String,
    /// Last event appended before this checkpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<EventId>,
    /// When the checkpoint was written.
    pub updated_at: Timestamp,
}

/// Durable position of a derivation, keyed by `(target, source)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationCheckpoint {
    /// The derived (target) store.
    pub view_name: StoreName,
    /// The source store replayed from.
    pub source_store: StoreName,
    /// The target store written to (same as `view_name`).
    pub target_store: StoreName,
    /// Signature of the filter this derivation uses.
    pub filter_hash: String,
    /// Evaluation mode pinned at first derive.
    pub evaluation_mode: EvaluationMode,
    /// Last source event replayed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_source_event_id: Option<EventId>,
    /// Source events examined over the lifetime of this derivation.
    pub events_processed: u64,
    /// Upserts that matched the filter.
    pub events_matched: u64,
    /// Deletes propagated.
    pub deletes_propagated: u64,
    /// When the checkpoint was written.
    pub updated_at: Timestamp,
}

/// One source entry of a lineage record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageSource {
    /// The source store.
    pub store_name: StoreName,
    /// The filter expression used.
    pub filter: FilterExpr,
    /// Its canonical signature.
    pub filter_hash: String,
    /// Evaluation mode.
    pub evaluation_mode: EvaluationMode,
    /// When this source was last derived from.
    pub derived_at: Timestamp,
}

/// Lineage record of a derived store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreLineage {
    /// The derived store.
    pub store_name: StoreName,
    /// Always true for records written by the derivation engine.
    pub is_derived: bool,
    /// All sources this store derives from.
    pub sources: Vec<LineageSource>,
    /// When the record was last updated.
    pub updated_at: Timestamp,
}

/// Counters and staleness surfaced by `store stats`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Store name.
    pub name: StoreName,
    /// Live rows in `posts`.
    pub posts: u64,
    /// Rows in `event_log`.
    pub events: u64,
    /// Highest event id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<EventId>,
    /// Whether a lineage record exists.
    pub is_derived: bool,
    /// Whether any source has advanced past this store's checkpoint.
    pub stale: bool,
}

/// Scan ordering by `created_at`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Order {
    /// Oldest first (default).
    #[default]
    Asc,
    /// Newest first.
    Desc,
}

/// Predicates the index can answer from its own columns.
///
/// Anything else is applied above the index stream by the filter runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum IndexFilter {
    /// `has_images = 1`.
    HasImages,
    /// `has_video = 1`.
    HasVideo,
    /// `has_link = 1`.
    HasLinks,
    /// Exact author handle.
    Author {
        /// The handle.
        handle: Handle,
    },
    /// Post carries this hashtag.
    Hashtag {
        /// The tag.
        tag: Hashtag,
    },
    /// `created_at` within `[start, end)`.
    DateRange {
        /// Inclusive lower bound.
        start: Timestamp,
        /// Exclusive upper bound.
        end: Timestamp,
    },
}

/// Index scan request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreQuery {
    /// Index-answerable predicate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<IndexFilter>,
    /// Scan order (default ascending by `created_at`).
    #[serde(default)]
    pub order: Order,
    /// Hard cap on rows scanned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_limit: Option<u64>,
    /// Resume cursor from a previous scan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Shorthand author constraint (combined with `filter` via AND).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<Handle>,
    /// Shorthand hashtag constraint (combined with `filter` via AND).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashtag: Option<Hashtag>,
    /// Shorthand date range, `[start, end)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_range: Option<(Timestamp, Timestamp)>,
}

/// Search ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchSort {
    /// Newest first (default).
    #[default]
    Newest,
    /// Oldest first.
    Oldest,
}

/// Substring search request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Substring to look for (LIKE match, case-insensitive).
    pub query: String,
    /// Result order.
    #[serde(default)]
    pub sort: SearchSort,
    /// Maximum results per page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// OFFSET cursor from a previous page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// One page of search results.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    /// Matching posts.
    pub posts: Vec<skygent_core::post::Post>,
    /// Cursor for the next page, absent when exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// A thread group: root URI plus member count.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadGroup {
    /// `reply_root` shared by the group.
    pub root: String,
    /// Number of indexed posts in the group.
    pub posts: u64,
}
