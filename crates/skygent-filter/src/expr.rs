//! The filter AST.
//!
//! A closed tagged union discriminated by `_tag`, camelCase field names,
//! optional fields omitted when absent. The JSON form of this enum IS the
//! on-disk named-filter format and the input to signature hashing, so
//! shape changes are wire-format changes.

use serde::{Deserialize, Serialize};

use skygent_core::Timestamp;
use skygent_core::ids::{Handle, Hashtag};

/// What to do when an effectful predicate's provider fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum ErrorPolicy {
    /// Treat failure as a match.
    Include,
    /// Treat failure as a non-match.
    Exclude,
    /// Retry with exponential backoff, then propagate.
    Retry {
        /// Retries after the first attempt.
        max_retries: u32,
        /// Delay before the first retry, in milliseconds.
        base_delay_ms: u64,
    },
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::Exclude
    }
}

/// Algebraic filter expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum FilterExpr {
    /// Matches every post.
    All,
    /// Matches no post.
    None,
    /// Both sides match. Short-circuits left-to-right.
    And {
        /// Left operand.
        left: Box<FilterExpr>,
        /// Right operand.
        right: Box<FilterExpr>,
    },
    /// Either side matches. Short-circuits left-to-right.
    Or {
        /// Left operand.
        left: Box<FilterExpr>,
        /// Right operand.
        right: Box<FilterExpr>,
    },
    /// Negation.
    Not {
        /// Negated expression.
        expr: Box<FilterExpr>,
    },
    /// Author is exactly this handle.
    Author {
        /// The handle.
        handle: Handle,
    },
    /// Author is one of these handles.
    AuthorIn {
        /// Candidate handles (non-empty).
        handles: Vec<Handle>,
    },
    /// Post carries this hashtag.
    Hashtag {
        /// The tag.
        tag: Hashtag,
    },
    /// Post carries any of these hashtags.
    HashtagIn {
        /// Candidate tags (non-empty).
        tags: Vec<Hashtag>,
    },
    /// Post text contains a substring. Case-insensitive unless requested.
    Contains {
        /// Needle (non-empty).
        text: String,
        /// Match case-sensitively.
        #[serde(skip_serializing_if = "Option::is_none")]
        case_sensitive: Option<bool>,
    },
    /// Post is a reply.
    IsReply,
    /// Post quotes another record.
    IsQuote,
    /// Post arrived via repost.
    IsRepost,
    /// Not a reply, repost, or quote.
    IsOriginal,
    /// Engagement thresholds (at least one must be set).
    Engagement {
        /// Minimum likes.
        #[serde(skip_serializing_if = "Option::is_none")]
        min_likes: Option<u64>,
        /// Minimum reposts.
        #[serde(skip_serializing_if = "Option::is_none")]
        min_reposts: Option<u64>,
        /// Minimum replies.
        #[serde(skip_serializing_if = "Option::is_none")]
        min_replies: Option<u64>,
    },
    /// At least one image attached.
    HasImages,
    /// At least `min` images attached.
    MinImages {
        /// Minimum image count (≥ 1).
        min: u32,
    },
    /// Every attached image has non-empty alt text (and images exist).
    HasAltText,
    /// Images exist and at least one lacks alt text.
    NoAltText,
    /// Any image alt text contains this substring (case-insensitive).
    AltText {
        /// Needle (non-empty).
        text: String,
    },
    /// Any image alt text matches this regex.
    AltTextRegex {
        /// Pattern.
        pattern: String,
        /// Regex flags (`i`, `m`, `s`, `x`).
        #[serde(skip_serializing_if = "Option::is_none")]
        flags: Option<String>,
    },
    /// A video is attached.
    HasVideo,
    /// At least one link URL was extracted.
    HasLinks,
    /// Any media (image or video) attached.
    HasMedia,
    /// Any embed present.
    HasEmbed,
    /// Post language is one of these BCP-47 tags.
    Language {
        /// Accepted languages (non-empty).
        langs: Vec<String>,
    },
    /// Post text matches ANY of these regexes.
    Regex {
        /// Patterns (non-empty).
        patterns: Vec<String>,
        /// Regex flags (`i`, `m`, `s`, `x`).
        #[serde(skip_serializing_if = "Option::is_none")]
        flags: Option<String>,
    },
    /// Created within `[start, end)`. `start` must be strictly before `end`.
    DateRange {
        /// Inclusive lower bound.
        start: Timestamp,
        /// Exclusive upper bound.
        end: Timestamp,
    },
    /// Post has links and every one of them validates over the network.
    HasValidLinks {
        /// Failure policy.
        on_error: ErrorPolicy,
    },
    /// Tag is currently trending.
    Trending {
        /// The tag.
        tag: Hashtag,
        /// Failure policy.
        on_error: ErrorPolicy,
    },
    /// Any link URL contains this substring.
    LinkContains {
        /// Needle (non-empty).
        text: String,
        /// Match case-sensitively.
        #[serde(skip_serializing_if = "Option::is_none")]
        case_sensitive: Option<bool>,
        /// Match against redirect-resolved URLs (requires network).
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        check_resolved: bool,
        /// Failure policy (only consulted when `check_resolved`).
        #[serde(default)]
        on_error: ErrorPolicy,
    },
    /// Any link URL matches ANY of these regexes.
    LinkRegex {
        /// Patterns (non-empty).
        patterns: Vec<String>,
        /// Regex flags (`i`, `m`, `s`, `x`).
        #[serde(skip_serializing_if = "Option::is_none")]
        flags: Option<String>,
        /// Match against redirect-resolved URLs (requires network).
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        check_resolved: bool,
        /// Failure policy (only consulted when `check_resolved`).
        #[serde(default)]
        on_error: ErrorPolicy,
    },
    /// LLM classification against a natural-language criterion.
    Llm {
        /// Classification prompt (non-empty).
        prompt: String,
        /// Minimum confidence in `[0, 1]`.
        min_confidence: f64,
        /// Failure policy.
        on_error: ErrorPolicy,
    },
}

impl FilterExpr {
    /// Convenience constructor: `left AND right`.
    pub fn and(left: FilterExpr, right: FilterExpr) -> Self {
        Self::And {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Convenience constructor: `left OR right`.
    pub fn or(left: FilterExpr, right: FilterExpr) -> Self {
        Self::Or {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Convenience constructor: `NOT expr`.
    pub fn not(expr: FilterExpr) -> Self {
        Self::Not {
            expr: Box::new(expr),
        }
    }

    /// The `_tag` discriminator of this node.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::All => "All",
            Self::None => "None",
            Self::And { .. } => "And",
            Self::Or { .. } => "Or",
            Self::Not { .. } => "Not",
            Self::Author { .. } => "Author",
            Self::AuthorIn { .. } => "AuthorIn",
            Self::Hashtag { .. } => "Hashtag",
            Self::HashtagIn { .. } => "HashtagIn",
            Self::Contains { .. } => "Contains",
            Self::IsReply => "IsReply",
            Self::IsQuote => "IsQuote",
            Self::IsRepost => "IsRepost",
            Self::IsOriginal => "IsOriginal",
            Self::Engagement { .. } => "Engagement",
            Self::HasImages => "HasImages",
            Self::MinImages { .. } => "MinImages",
            Self::HasAltText => "HasAltText",
            Self::NoAltText => "NoAltText",
            Self::AltText { .. } => "AltText",
            Self::AltTextRegex { .. } => "AltTextRegex",
            Self::HasVideo => "HasVideo",
            Self::HasLinks => "HasLinks",
            Self::HasMedia => "HasMedia",
            Self::HasEmbed => "HasEmbed",
            Self::Language { .. } => "Language",
            Self::Regex { .. } => "Regex",
            Self::DateRange { .. } => "DateRange",
            Self::HasValidLinks { .. } => "HasValidLinks",
            Self::Trending { .. } => "Trending",
            Self::LinkContains { .. } => "LinkContains",
            Self::LinkRegex { .. } => "LinkRegex",
            Self::Llm { .. } => "Llm",
        }
    }

    /// Child expressions, for tree walks.
    pub fn children(&self) -> Vec<&FilterExpr> {
        match self {
            Self::And { left, right } | Self::Or { left, right } => vec![left, right],
            Self::Not { expr } => vec![expr],
            _ => Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
