//! The [`Post`] snapshot — the immutable unit flowing through the system.
//!
//! A `Post` is a point-in-time capture of a network post together with the
//! derived fields the parser extracts from facets (hashtags, mentions,
//! links). The wire format is camelCase with `_tag`-discriminated unions,
//! and optional fields are omitted when absent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Timestamp;
use crate::ids::{Did, Handle, Hashtag, PostUri};

/// Strong reference to a record: URI plus content hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrongRef {
    /// Record URI.
    pub uri: String,
    /// Record CID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

/// Reply references: thread root and immediate parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRefs {
    /// Root of the thread.
    pub root: StrongRef,
    /// Immediate parent post.
    pub parent: StrongRef,
}

/// One image inside an [`Embed::Images`] embed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedImage {
    /// Alt text (empty string when the author provided none).
    #[serde(default)]
    pub alt: String,
    /// Full-size image URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fullsize: Option<String>,
    /// Thumbnail URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb: Option<String>,
}

/// Post embed — closed tagged union.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum Embed {
    /// One to four attached images.
    Images {
        /// The attached images.
        images: Vec<EmbedImage>,
    },
    /// External link card.
    External {
        /// Link target.
        uri: String,
        /// Card title.
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Card description.
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// Card thumbnail URL.
        #[serde(skip_serializing_if = "Option::is_none")]
        thumb: Option<String>,
    },
    /// Attached video.
    Video {
        /// Alt text.
        #[serde(skip_serializing_if = "Option::is_none")]
        alt: Option<String>,
        /// Poster frame URL.
        #[serde(skip_serializing_if = "Option::is_none")]
        thumbnail: Option<String>,
    },
    /// Quoted record (quote post).
    Record {
        /// URI of the quoted record.
        uri: String,
        /// CID of the quoted record.
        #[serde(skip_serializing_if = "Option::is_none")]
        cid: Option<String>,
    },
    /// Quoted record plus attached media.
    RecordWithMedia {
        /// The quoted record.
        record: StrongRef,
        /// The attached media embed.
        media: Box<Embed>,
    },
    /// Embed type this version does not model. Raw value preserved.
    Unknown {
        /// The raw embed JSON.
        #[serde(default)]
        raw: Value,
    },
}

impl Embed {
    /// Number of attached images, recursing through `RecordWithMedia`.
    pub fn image_count(&self) -> usize {
        match self {
            Self::Images { images } => images.len(),
            Self::RecordWithMedia { media, .. } => media.image_count(),
            _ => 0,
        }
    }

    /// Whether any attached image exists.
    pub fn has_images(&self) -> bool {
        self.image_count() > 0
    }

    /// Whether a video is attached, recursing through `RecordWithMedia`.
    pub fn has_video(&self) -> bool {
        match self {
            Self::Video { .. } => true,
            Self::RecordWithMedia { media, .. } => media.has_video(),
            _ => false,
        }
    }

    /// Alt texts of all attached images, in order.
    pub fn alt_texts(&self) -> Vec<&str> {
        match self {
            Self::Images { images } => images.iter().map(|i| i.alt.as_str()).collect(),
            Self::RecordWithMedia { media, .. } => media.alt_texts(),
            _ => Vec::new(),
        }
    }

    /// Whether this embed quotes another record.
    pub fn is_quote(&self) -> bool {
        matches!(self, Self::Record { .. } | Self::RecordWithMedia { .. })
    }
}

/// Engagement counters. Absent counters are zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMetrics {
    /// Like count.
    #[serde(default)]
    pub like: u64,
    /// Repost count.
    #[serde(default)]
    pub repost: u64,
    /// Reply count.
    #[serde(default)]
    pub reply: u64,
    /// Quote count.
    #[serde(default)]
    pub quote: u64,
    /// Bookmark count.
    #[serde(default)]
    pub bookmark: u64,
}

/// Why a post appeared in a feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum FeedReason {
    /// Repost by another account.
    ReasonRepost {
        /// Who reposted.
        #[serde(skip_serializing_if = "Option::is_none")]
        by: Option<Handle>,
        /// When the repost was indexed.
        #[serde(skip_serializing_if = "Option::is_none")]
        indexed_at: Option<Timestamp>,
    },
    /// Pinned post.
    ReasonPin,
}

/// Feed context attached when the post came from a feed endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedContext {
    /// Repost/pin reason, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FeedReason>,
    /// Raw reply refs from the feed view (root/parent views).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<Value>,
}

/// Immutable snapshot of a post.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// Record URI.
    pub uri: PostUri,
    /// Record CID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Author handle.
    pub author: Handle,
    /// Author DID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_did: Option<Did>,
    /// Post text.
    pub text: String,
    /// Author-declared creation time.
    pub created_at: Timestamp,
    /// Hashtags extracted from facets and inline text.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub hashtags: BTreeSet<Hashtag>,
    /// Mentioned handles, in facet order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<Handle>,
    /// DIDs of the mentioned accounts, when known.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mention_dids: Vec<Did>,
    /// Link URLs from facets and the external embed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    /// Reply refs when the post is a reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRefs>,
    /// Embedded media / record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed: Option<Embed>,
    /// Engagement counters at capture time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PostMetrics>,
    /// Raw rich-text facets, preserved verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facets: Option<Value>,
    /// BCP-47 language tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub langs: Vec<String>,
    /// Author-applied outline tags (not hashtags).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Author self-labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub self_labels: Vec<String>,
    /// Moderation labels applied by services.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// When the network indexed the post.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<Timestamp>,
    /// Feed context (repost/pin reason, reply views).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<FeedContext>,
}

impl Post {
    /// Whether the post is a reply.
    pub fn is_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Whether the post arrived via a repost.
    pub fn is_repost(&self) -> bool {
        matches!(
            self.feed.as_ref().and_then(|f| f.reason.as_ref()),
            Some(FeedReason::ReasonRepost { .. })
        )
    }

    /// Whether the post quotes another record.
    pub fn is_quote(&self) -> bool {
        self.embed.as_ref().is_some_and(Embed::is_quote)
    }

    /// Original post: not a reply, repost, or quote.
    pub fn is_original(&self) -> bool {
        !self.is_reply() && !self.is_repost() && !self.is_quote()
    }

    /// Whether any image is attached.
    pub fn has_images(&self) -> bool {
        self.embed.as_ref().is_some_and(Embed::has_images)
    }

    /// Whether a video is attached.
    pub fn has_video(&self) -> bool {
        self.embed.as_ref().is_some_and(Embed::has_video)
    }

    /// Whether any link URL was extracted.
    pub fn has_links(&self) -> bool {
        !self.links.is_empty()
    }

    /// Whether any media (image or video) is attached.
    pub fn has_media(&self) -> bool {
        self.has_images() || self.has_video()
    }

    /// Calendar date (UTC) of `created_at`, `YYYY-MM-DD`.
    pub fn created_date(&self) -> String {
        self.created_at.format("%Y-%m-%d").to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
