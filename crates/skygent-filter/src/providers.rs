//! Capability traits for effectful predicates, plus test doubles.
//!
//! The runtime never talks to the network directly — it goes through these
//! traits. Real implementations (HTTP link checker, trending endpoint, LLM
//! provider) live outside the core; the doubles here back unit tests and
//! the `detached` runtime used for pure-only evaluation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use skygent_core::post::Post;

use crate::errors::ProviderError;

/// Network link checking and redirect resolution, batched.
#[async_trait]
pub trait LinkValidator: Send + Sync {
    /// Check reachability for each URL. Keys of the returned map are the
    /// input URLs; missing keys are treated as invalid.
    async fn validate(&self, urls: &[String]) -> Result<HashMap<String, bool>, ProviderError>;

    /// Follow redirects and return the final URL for each input.
    async fn resolve(&self, urls: &[String]) -> Result<HashMap<String, String>, ProviderError>;
}

/// Source of the current trending tag set.
#[async_trait]
pub trait TrendingProvider: Send + Sync {
    /// Currently trending tags, `#`-prefixed or bare.
    async fn trending_tags(&self) -> Result<Vec<String>, ProviderError>;
}

/// One classification verdict.
#[derive(Clone, Debug, PartialEq)]
pub struct LlmVerdict {
    /// URI of the judged post.
    pub uri: String,
    /// Whether the post matches the criterion.
    pub matched: bool,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// LLM post classification, batched per prompt.
#[async_trait]
pub trait LlmClassifier: Send + Sync {
    /// Judge every post against the prompt. Posts missing from the answer
    /// are treated as non-matching.
    async fn classify(&self, prompt: &str, posts: &[Post]) -> Result<Vec<LlmVerdict>, ProviderError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Doubles
// ─────────────────────────────────────────────────────────────────────────────

/// Provider that fails every call. Backs the detached runtime, where the
/// `ErrorPolicy` decides what a missing capability means.
#[derive(Debug, Default)]
pub struct UnavailableProvider;

#[async_trait]
impl LinkValidator for UnavailableProvider {
    async fn validate(&self, _urls: &[String]) -> Result<HashMap<String, bool>, ProviderError> {
        Err(ProviderError::Unavailable("link validator".into()))
    }

    async fn resolve(&self, _urls: &[String]) -> Result<HashMap<String, String>, ProviderError> {
        Err(ProviderError::Unavailable("link validator".into()))
    }
}

#[async_trait]
impl TrendingProvider for UnavailableProvider {
    async fn trending_tags(&self) -> Result<Vec<String>, ProviderError> {
        Err(ProviderError::Unavailable("trending provider".into()))
    }
}

#[async_trait]
impl LlmClassifier for UnavailableProvider {
    async fn classify(
        &self,
        _prompt: &str,
        _posts: &[Post],
    ) -> Result<Vec<LlmVerdict>, ProviderError> {
        Err(ProviderError::Unavailable("llm classifier".into()))
    }
}

/// In-memory link validator with call counting.
#[derive(Debug, Default)]
pub struct StaticLinkValidator {
    valid: HashSet<String>,
    resolved: HashMap<String, String>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticLinkValidator {
    /// Validator that accepts exactly these URLs.
    pub fn accepting(urls: impl IntoIterator<Item = impl Into<String>>) -> Arc<Self> {
        Arc::new(Self {
            valid: urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        })
    }

    /// Validator whose every call fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    /// Add a redirect mapping for `resolve`.
    pub fn with_redirect(mut self: Arc<Self>, from: &str, to: &str) -> Arc<Self> {
        let this = Arc::get_mut(&mut self).expect("builder used before sharing");
        let _ = this.resolved.insert(from.to_string(), to.to_string());
        self
    }

    /// Number of provider calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkValidator for StaticLinkValidator {
    async fn validate(&self, urls: &[String]) -> Result<HashMap<String, bool>, ProviderError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Network("link check failed".into()));
        }
        Ok(urls
            .iter()
            .map(|u| (u.clone(), self.valid.contains(u)))
            .collect())
    }

    async fn resolve(&self, urls: &[String]) -> Result<HashMap<String, String>, ProviderError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Network("resolve failed".into()));
        }
        Ok(urls
            .iter()
            .map(|u| {
                let target = self.resolved.get(u).cloned().unwrap_or_else(|| u.clone());
                (u.clone(), target)
            })
            .collect())
    }
}

/// Fixed trending tag set with call counting.
#[derive(Debug, Default)]
pub struct StaticTrending {
    tags: Vec<String>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticTrending {
    /// Provider reporting exactly these tags as trending.
    pub fn with_tags(tags: impl IntoIterator<Item = impl Into<String>>) -> Arc<Self> {
        Arc::new(Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        })
    }

    /// Provider whose every call fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    /// Number of provider calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrendingProvider for StaticTrending {
    async fn trending_tags(&self) -> Result<Vec<String>, ProviderError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Network("trending fetch failed".into()));
        }
        Ok(self.tags.clone())
    }
}

/// Substring-matching classifier double: a post matches when its text
/// contains the prompt, with fixed confidence.
#[derive(Debug)]
pub struct StaticLlm {
    confidence: f64,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticLlm {
    /// Classifier answering with this confidence for matching posts.
    pub fn with_confidence(confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            confidence,
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    /// Classifier whose every call fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            confidence: 0.0,
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of provider calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClassifier for StaticLlm {
    async fn classify(&self, prompt: &str, posts: &[Post]) -> Result<Vec<LlmVerdict>, ProviderError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::Network("llm call failed".into()));
        }
        Ok(posts
            .iter()
            .map(|p| LlmVerdict {
                uri: p.uri.to_string(),
                matched: p.text.to_lowercase().contains(&prompt.to_lowercase()),
                confidence: self.confidence,
            })
            .collect())
    }
}
