//! The `DataSource` capability.
//!
//! The network transport lives outside the core: anything that can
//! produce a lazy stream of raw post records is a source. Records carry an
//! optional page-cursor sentinel — the sync engine checkpoints whenever it
//! sees one, so ingestion resumes at page granularity.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SourceError;

/// One raw item from a source.
#[derive(Clone, Debug, PartialEq)]
pub struct RawPost {
    /// The raw record (feed-view-post-shaped JSON).
    pub record: Value,
    /// Page boundary marker: when set, everything up to and including this
    /// item belongs to the page this cursor closes.
    pub page_cursor: Option<String>,
}

impl RawPost {
    /// Item without a page marker.
    pub fn new(record: Value) -> Self {
        Self {
            record,
            page_cursor: None,
        }
    }

    /// Item closing a page.
    pub fn with_cursor(record: Value, cursor: impl Into<String>) -> Self {
        Self {
            record,
            page_cursor: Some(cursor.into()),
        }
    }
}

/// Which network endpoint a source wraps. The descriptor's key is the
/// canonical identity used for sync checkpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum SourceDescriptor {
    /// The signed-in user's home timeline.
    Timeline,
    /// The signed-in user's notifications.
    Notifications,
    /// A feed generator, by AT-URI.
    Feed {
        /// Feed AT-URI.
        uri: String,
    },
    /// An author's feed.
    Author {
        /// Handle or DID.
        actor: String,
    },
    /// A post thread.
    Thread {
        /// Root post AT-URI.
        uri: String,
    },
    /// The jetstream firehose.
    Jetstream {
        /// Websocket endpoint.
        endpoint: String,
    },
}

impl SourceDescriptor {
    /// Canonical checkpoint key.
    pub fn key(&self) -> String {
        match self {
            Self::Timeline => "timeline".into(),
            Self::Notifications => "notifications".into(),
            Self::Feed { uri } => format!("feed:{uri}"),
            Self::Author { actor } => format!("author:{actor}"),
            Self::Thread { uri } => format!("thread:{uri}"),
            Self::Jetstream { endpoint } => format!("jetstream:{endpoint}"),
        }
    }
}

/// A lazy, finite-or-infinite producer of raw posts.
///
/// `stream` must be restartable by calling it again — each call builds a
/// fresh stream beginning at `cursor` (a page cursor previously emitted by
/// this source), or at the start when `None`.
pub trait DataSource: Send + Sync {
    /// Which endpoint this source wraps.
    fn descriptor(&self) -> SourceDescriptor;

    /// Build a stream starting after `cursor`.
    fn stream(
        &self,
        cursor: Option<String>,
    ) -> BoxStream<'static, Result<RawPost, SourceError>>;
}

/// In-memory source for tests and fixtures: a fixed sequence of pages.
pub struct VecSource {
    descriptor: SourceDescriptor,
    pages: Vec<(Vec<Value>, Option<String>)>,
}

impl VecSource {
    /// Source over explicit pages; each page is `(records, cursor)`.
    pub fn new(
        descriptor: SourceDescriptor,
        pages: Vec<(Vec<Value>, Option<String>)>,
    ) -> Self {
        Self { descriptor, pages }
    }

    /// Single-page source with one closing cursor.
    pub fn single_page(records: Vec<Value>, cursor: Option<&str>) -> Self {
        Self::new(
            SourceDescriptor::Timeline,
            vec![(records, cursor.map(Into::into))],
        )
    }
}

impl DataSource for VecSource {
    fn descriptor(&self) -> SourceDescriptor {
        self.descriptor.clone()
    }

    fn stream(
        &self,
        cursor: Option<String>,
    ) -> BoxStream<'static, Result<RawPost, SourceError>> {
        // Resume strictly after the page whose cursor matches.
        let start = match &cursor {
            Some(c) => self
                .pages
                .iter()
                .position(|(_, page_cursor)| page_cursor.as_deref() == Some(c))
                .map_or(self.pages.len(), |i| i + 1),
            None => 0,
        };
        let items: Vec<RawPost> = self.pages[start..]
            .iter()
            .flat_map(|(records, page_cursor)| {
                let last = records.len().saturating_sub(1);
                records.iter().enumerate().map(move |(i, record)| RawPost {
                    record: record.clone(),
                    page_cursor: if i == last {
                        page_cursor.clone()
                    } else {
                        None
                    },
                })
            })
            .collect();
        Box::pin(futures::stream::iter(items.into_iter().map(Ok)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn descriptor_keys_are_canonical() {
        assert_eq!(SourceDescriptor::Timeline.key(), "timeline");
        assert_eq!(
            SourceDescriptor::Feed {
                uri: "at://did:plc:x/app.bsky.feed.generator/hot".into()
            }
            .key(),
            "feed:at://did:plc:x/app.bsky.feed.generator/hot"
        );
        assert_eq!(
            SourceDescriptor::Author {
                actor: "alice.test".into()
            }
            .key(),
            "author:alice.test"
        );
    }

    #[tokio::test]
    async fn vec_source_marks_page_boundaries() {
        let source = VecSource::new(
            SourceDescriptor::Timeline,
            vec![
                (vec![json!({"n": 1}), json!({"n": 2})], Some("c1".into())),
                (vec![json!({"n": 3})], None),
            ],
        );
        let items: Vec<RawPost> = source
            .stream(None)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].page_cursor, None);
        assert_eq!(items[1].page_cursor.as_deref(), Some("c1"));
        assert_eq!(items[2].page_cursor, None);
    }

    #[tokio::test]
    async fn vec_source_resumes_after_cursor() {
        let source = VecSource::new(
            SourceDescriptor::Timeline,
            vec![
                (vec![json!({"n": 1})], Some("c1".into())),
                (vec![json!({"n": 2})], Some("c2".into())),
            ],
        );
        let items: Vec<RawPost> = source
            .stream(Some("c1".into()))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].record["n"], 2);

        // Unknown cursor: nothing to replay.
        let items = source.stream(Some("zzz".into())).collect::<Vec<_>>().await;
        assert!(items.is_empty());
    }
}
