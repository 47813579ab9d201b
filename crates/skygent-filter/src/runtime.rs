//! Filter evaluation.
//!
//! One [`FilterRuntime`] serves three entry points over the same evaluator:
//! [`FilterRuntime::evaluate`] (single post), [`FilterRuntime::evaluate_batch`]
//! (index-aligned booleans), and [`FilterRuntime::explain`] (per-node
//! reasons). The three agree by construction: they share one recursive
//! evaluator and one per-batch effect cache.
//!
//! Effectful predicates (link validation, trending, LLM) call their provider
//! at most ONCE per batch per node: the first post to reach a node performs
//! the provider call for the whole batch and caches the outcome under the
//! node's canonical signature. `And`/`Or` short-circuit left-to-right, so a
//! node no post reaches never touches the network.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;
use tracing::warn;

use skygent_core::post::Post;
use skygent_core::retry::RetryConfig;

use crate::compile::build_regex;
use crate::errors::{FilterEvalError, ProviderError};
use crate::expr::{ErrorPolicy, FilterExpr};
use crate::providers::{LinkValidator, LlmClassifier, TrendingProvider, UnavailableProvider};
use crate::signature::canonical_json;

/// Outcome of an effectful node's provider call, cached per batch.
enum NodeOutcome {
    /// Policy absorbed a failure; every post gets this verdict.
    Forced(bool),
    /// url → reachable.
    LinkValidity(HashMap<String, bool>),
    /// url → final URL after redirects.
    ResolvedUrls(HashMap<String, String>),
    /// Bare lowercase trending tags.
    TrendingTags(HashSet<String>),
    /// post uri → passes this node's confidence threshold.
    LlmMatches(HashMap<String, bool>),
}

/// Per-batch evaluation state.
struct BatchCtx<'p> {
    posts: &'p [Post],
    regexes: HashMap<(String, Option<String>), Regex>,
    outcomes: HashMap<String, NodeOutcome>,
}

impl<'p> BatchCtx<'p> {
    fn new(posts: &'p [Post]) -> Self {
        Self {
            posts,
            regexes: HashMap::new(),
            outcomes: HashMap::new(),
        }
    }

    fn regex(&mut self, pattern: &str, flags: Option<&str>) -> Result<&Regex, FilterEvalError> {
        let key = (pattern.to_string(), flags.map(str::to_string));
        if !self.regexes.contains_key(&key) {
            let re = build_regex(pattern, flags)
                .map_err(|e| FilterEvalError::new(e.message))?;
            let _ = self.regexes.insert(key.clone(), re);
        }
        Ok(&self.regexes[&key])
    }

    /// Distinct link URLs across the whole batch, in stable order.
    fn batch_links(&self) -> Vec<String> {
        self.posts
            .iter()
            .flat_map(|p| p.links.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// One line of an explanation.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reason {
    /// Node `_tag`.
    pub tag: String,
    /// Whether this node matched the post.
    pub ok: bool,
    /// Extra context (error message, matched value).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of `filter explain`: overall verdict plus one reason per node in
/// pre-order.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Explanation {
    /// Overall verdict — identical to what `evaluate` returns.
    pub ok: bool,
    /// Pre-order node verdicts.
    pub reasons: Vec<Reason>,
}

/// The evaluator, carrying the effectful capability providers.
#[derive(Clone)]
pub struct FilterRuntime {
    links: Arc<dyn LinkValidator>,
    trending: Arc<dyn TrendingProvider>,
    llm: Arc<dyn LlmClassifier>,
}

impl FilterRuntime {
    /// Runtime with real (or test-double) providers.
    pub fn new(
        links: Arc<dyn LinkValidator>,
        trending: Arc<dyn TrendingProvider>,
        llm: Arc<dyn LlmClassifier>,
    ) -> Self {
        Self {
            links,
            trending,
            llm,
        }
    }

    /// Runtime without providers. Pure expressions evaluate normally;
    /// effectful ones fall back to their `ErrorPolicy`.
    pub fn detached() -> Self {
        let unavailable = Arc::new(UnavailableProvider);
        Self {
            links: unavailable.clone(),
            trending: unavailable.clone(),
            llm: unavailable,
        }
    }

    /// Evaluate one post.
    pub async fn evaluate(&self, expr: &FilterExpr, post: &Post) -> Result<bool, FilterEvalError> {
        let batch = self.evaluate_batch(expr, std::slice::from_ref(post)).await?;
        Ok(batch[0])
    }

    /// Evaluate a batch; result is index-aligned with `posts`.
    pub async fn evaluate_batch(
        &self,
        expr: &FilterExpr,
        posts: &[Post],
    ) -> Result<Vec<bool>, FilterEvalError> {
        let mut ctx = BatchCtx::new(posts);
        let mut out = Vec::with_capacity(posts.len());
        for post in posts {
            out.push(self.eval(expr, post, &mut ctx).await?);
        }
        Ok(out)
    }

    /// Evaluate one post and report a per-node verdict tree (pre-order).
    ///
    /// The overall `ok` equals `evaluate`'s result exactly. Nodes that
    /// short-circuiting would skip are still reported; if such a node's
    /// provider fails terminally, the failure becomes that node's `detail`
    /// rather than an error.
    pub async fn explain(
        &self,
        expr: &FilterExpr,
        post: &Post,
    ) -> Result<Explanation, FilterEvalError> {
        let posts = std::slice::from_ref(post);
        let mut ctx = BatchCtx::new(posts);
        let ok = self.eval(expr, post, &mut ctx).await?;
        let mut reasons = Vec::new();
        self.collect_reasons(expr, post, &mut ctx, &mut reasons).await;
        Ok(Explanation { ok, reasons })
    }

    fn collect_reasons<'a, 'p: 'a>(
        &'a self,
        expr: &'a FilterExpr,
        post: &'a Post,
        ctx: &'a mut BatchCtx<'p>,
        reasons: &'a mut Vec<Reason>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let reason = match self.eval(expr, post, ctx).await {
                Ok(ok) => Reason {
                    tag: expr.tag().to_string(),
                    ok,
                    detail: None,
                },
                Err(e) => Reason {
                    tag: expr.tag().to_string(),
                    ok: false,
                    detail: Some(e.to_string()),
                },
            };
            reasons.push(reason);
            for child in expr.children() {
                self.collect_reasons(child, post, ctx, reasons).await;
            }
        })
    }

    #[allow(clippy::too_many_lines)]
    fn eval<'a, 'p: 'a>(
        &'a self,
        expr: &'a FilterExpr,
        post: &'a Post,
        ctx: &'a mut BatchCtx<'p>,
    ) -> BoxFuture<'a, Result<bool, FilterEvalError>> {
        Box::pin(async move {
            match expr {
                FilterExpr::All => Ok(true),
                FilterExpr::None => Ok(false),
                FilterExpr::And { left, right } => {
                    if !self.eval(left, post, ctx).await? {
                        return Ok(false);
                    }
                    self.eval(right, post, ctx).await
                }
                FilterExpr::Or { left, right } => {
                    if self.eval(left, post, ctx).await? {
                        return Ok(true);
                    }
                    self.eval(right, post, ctx).await
                }
                FilterExpr::Not { expr } => Ok(!self.eval(expr, post, ctx).await?),

                FilterExpr::Author { handle } => Ok(post.author == *handle),
                FilterExpr::AuthorIn { handles } => Ok(handles.contains(&post.author)),
                FilterExpr::Hashtag { tag } => Ok(post.hashtags.contains(tag)),
                FilterExpr::HashtagIn { tags } => {
                    Ok(tags.iter().any(|t| post.hashtags.contains(t)))
                }
                FilterExpr::Contains {
                    text,
                    case_sensitive,
                } => Ok(contains(&post.text, text, case_sensitive.unwrap_or(false))),

                FilterExpr::IsReply => Ok(post.is_reply()),
                FilterExpr::IsQuote => Ok(post.is_quote()),
                FilterExpr::IsRepost => Ok(post.is_repost()),
                FilterExpr::IsOriginal => Ok(post.is_original()),

                FilterExpr::Engagement {
                    min_likes,
                    min_reposts,
                    min_replies,
                } => {
                    let metrics = post.metrics.unwrap_or_default();
                    Ok(metrics.like >= min_likes.unwrap_or(0)
                        && metrics.repost >= min_reposts.unwrap_or(0)
                        && metrics.reply >= min_replies.unwrap_or(0))
                }

                FilterExpr::HasImages => Ok(post.has_images()),
                FilterExpr::MinImages { min } => Ok(post
                    .embed
                    .as_ref()
                    .is_some_and(|e| e.image_count() >= *min as usize)),
                FilterExpr::HasAltText => {
                    let alts = alt_texts(post);
                    Ok(!alts.is_empty() && alts.iter().all(|a| !a.trim().is_empty()))
                }
                FilterExpr::NoAltText => {
                    let alts = alt_texts(post);
                    Ok(!alts.is_empty() && alts.iter().any(|a| a.trim().is_empty()))
                }
                FilterExpr::AltText { text } => Ok(alt_texts(post)
                    .iter()
                    .any(|a| contains(a, text, false))),
                FilterExpr::AltTextRegex { pattern, flags } => {
                    let re = ctx.regex(pattern, flags.as_deref())?;
                    Ok(alt_texts(post).iter().any(|a| re.is_match(a)))
                }

                FilterExpr::HasVideo => Ok(post.has_video()),
                FilterExpr::HasLinks => Ok(post.has_links()),
                FilterExpr::HasMedia => Ok(post.has_media()),
                FilterExpr::HasEmbed => Ok(post.embed.is_some()),

                FilterExpr::Language { langs } => Ok(post.langs.iter().any(|have| {
                    let have = have.to_lowercase();
                    let have_primary = have.split('-').next().unwrap_or(&have).to_string();
                    langs.iter().any(|want| {
                        let want = want.to_lowercase();
                        have == want || have_primary == want
                    })
                })),

                FilterExpr::Regex { patterns, flags } => {
                    for pattern in patterns {
                        let re = ctx.regex(pattern, flags.as_deref())?;
                        if re.is_match(&post.text) {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }

                FilterExpr::DateRange { start, end } => {
                    Ok(post.created_at >= *start && post.created_at < *end)
                }

                FilterExpr::HasValidLinks { on_error } => {
                    if post.links.is_empty() {
                        return Ok(false);
                    }
                    let key = canonical_json(expr);
                    self.ensure_link_validity(&key, on_error, ctx).await?;
                    match &ctx.outcomes[&key] {
                        NodeOutcome::Forced(b) => Ok(*b),
                        NodeOutcome::LinkValidity(map) => Ok(post
                            .links
                            .iter()
                            .all(|u| map.get(u).copied().unwrap_or(false))),
                        _ => Err(FilterEvalError::new("link validity cache corrupted")),
                    }
                }

                FilterExpr::Trending { tag, on_error } => {
                    let key = canonical_json(expr);
                    if !ctx.outcomes.contains_key(&key) {
                        let trending = self.trending.clone();
                        let outcome = with_policy(on_error, "trending lookup", move || {
                            let trending = trending.clone();
                            async move { trending.trending_tags().await }
                        })
                        .await?;
                        let outcome = match outcome {
                            Fetched::Forced(b) => NodeOutcome::Forced(b),
                            Fetched::Value(tags) => NodeOutcome::TrendingTags(
                                tags.iter()
                                    .map(|t| t.trim_start_matches('#').to_lowercase())
                                    .collect(),
                            ),
                        };
                        let _ = ctx.outcomes.insert(key.clone(), outcome);
                    }
                    match &ctx.outcomes[&key] {
                        NodeOutcome::Forced(b) => Ok(*b),
                        NodeOutcome::TrendingTags(tags) => Ok(tags.contains(tag.bare())),
                        _ => Err(FilterEvalError::new("trending cache corrupted")),
                    }
                }

                FilterExpr::LinkContains {
                    text,
                    case_sensitive,
                    check_resolved,
                    on_error,
                } => {
                    let cs = case_sensitive.unwrap_or(false);
                    if !check_resolved {
                        return Ok(post.links.iter().any(|u| contains(u, text, cs)));
                    }
                    if post.links.is_empty() {
                        return Ok(false);
                    }
                    let key = canonical_json(expr);
                    self.ensure_resolved(&key, on_error, ctx).await?;
                    match &ctx.outcomes[&key] {
                        NodeOutcome::Forced(b) => Ok(*b),
                        NodeOutcome::ResolvedUrls(map) => Ok(post.links.iter().any(|u| {
                            let target = map.get(u).map_or(u.as_str(), String::as_str);
                            contains(target, text, cs)
                        })),
                        _ => Err(FilterEvalError::new("resolved-url cache corrupted")),
                    }
                }

                FilterExpr::LinkRegex {
                    patterns,
                    flags,
                    check_resolved,
                    on_error,
                } => {
                    if !check_resolved {
                        for pattern in patterns {
                            let re = ctx.regex(pattern, flags.as_deref())?;
                            if post.links.iter().any(|u| re.is_match(u)) {
                                return Ok(true);
                            }
                        }
                        return Ok(false);
                    }
                    if post.links.is_empty() {
                        return Ok(false);
                    }
                    let key = canonical_json(expr);
                    self.ensure_resolved(&key, on_error, ctx).await?;
                    let forced = match &ctx.outcomes[&key] {
                        NodeOutcome::Forced(b) => Some(*b),
                        NodeOutcome::ResolvedUrls(_) => Option::None,
                        _ => return Err(FilterEvalError::new("resolved-url cache corrupted")),
                    };
                    if let Some(b) = forced {
                        return Ok(b);
                    }
                    let targets: Vec<String> = match &ctx.outcomes[&key] {
                        NodeOutcome::ResolvedUrls(map) => post
                            .links
                            .iter()
                            .map(|u| map.get(u).cloned().unwrap_or_else(|| u.clone()))
                            .collect(),
                        _ => unreachable!("checked above"),
                    };
                    for pattern in patterns {
                        let re = ctx.regex(pattern, flags.as_deref())?;
                        if targets.iter().any(|t| re.is_match(t)) {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }

                FilterExpr::Llm {
                    prompt,
                    min_confidence,
                    on_error,
                } => {
                    let key = canonical_json(expr);
                    if !ctx.outcomes.contains_key(&key) {
                        let llm = self.llm.clone();
                        let posts = ctx.posts;
                        let prompt_owned = prompt.clone();
                        let outcome = with_policy(on_error, "llm classification", move || {
                            let llm = llm.clone();
                            let prompt = prompt_owned.clone();
                            async move { llm.classify(&prompt, posts).await }
                        })
                        .await?;
                        let outcome = match outcome {
                            Fetched::Forced(b) => NodeOutcome::Forced(b),
                            Fetched::Value(verdicts) => NodeOutcome::LlmMatches(
                                verdicts
                                    .into_iter()
                                    .map(|v| {
                                        (v.uri, v.matched && v.confidence >= *min_confidence)
                                    })
                                    .collect(),
                            ),
                        };
                        let _ = ctx.outcomes.insert(key.clone(), outcome);
                    }
                    match &ctx.outcomes[&key] {
                        NodeOutcome::Forced(b) => Ok(*b),
                        NodeOutcome::LlmMatches(map) => Ok(map
                            .get(post.uri.as_str())
                            .copied()
                            .unwrap_or(false)),
                        _ => Err(FilterEvalError::new("llm cache corrupted")),
                    }
                }
            }
        })
    }

    async fn ensure_link_validity(
        &self,
        key: &str,
        policy: &ErrorPolicy,
        ctx: &mut BatchCtx<'_>,
    ) -> Result<(), FilterEvalError> {
        if ctx.outcomes.contains_key(key) {
            return Ok(());
        }
        let urls = ctx.batch_links();
        let links = self.links.clone();
        let outcome = with_policy(policy, "link validation", move || {
            let links = links.clone();
            let urls = urls.clone();
            async move { links.validate(&urls).await }
        })
        .await?;
        let outcome = match outcome {
            Fetched::Forced(b) => NodeOutcome::Forced(b),
            Fetched::Value(map) => NodeOutcome::LinkValidity(map),
        };
        let _ = ctx.outcomes.insert(key.to_string(), outcome);
        Ok(())
    }

    async fn ensure_resolved(
        &self,
        key: &str,
        policy: &ErrorPolicy,
        ctx: &mut BatchCtx<'_>,
    ) -> Result<(), FilterEvalError> {
        if ctx.outcomes.contains_key(key) {
            return Ok(());
        }
        let urls = ctx.batch_links();
        let links = self.links.clone();
        let outcome = with_policy(policy, "link resolution", move || {
            let links = links.clone();
            let urls = urls.clone();
            async move { links.resolve(&urls).await }
        })
        .await?;
        let outcome = match outcome {
            Fetched::Forced(b) => NodeOutcome::Forced(b),
            Fetched::Value(map) => NodeOutcome::ResolvedUrls(map),
        };
        let _ = ctx.outcomes.insert(key.to_string(), outcome);
        Ok(())
    }
}

enum Fetched<T> {
    Value(T),
    Forced(bool),
}

/// Run a provider call under an error policy.
///
/// `Include`/`Exclude` absorb the failure into a forced verdict; `Retry`
/// backs off exponentially and propagates after exhaustion.
async fn with_policy<T, F, Fut>(
    policy: &ErrorPolicy,
    what: &str,
    mut op: F,
) -> Result<Fetched<T>, FilterEvalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    match policy {
        ErrorPolicy::Include | ErrorPolicy::Exclude => match op().await {
            Ok(value) => Ok(Fetched::Value(value)),
            Err(e) => {
                let verdict = matches!(policy, ErrorPolicy::Include);
                warn!(error = %e, what, forced = verdict, "provider failed, policy absorbs");
                Ok(Fetched::Forced(verdict))
            }
        },
        ErrorPolicy::Retry {
            max_retries,
            base_delay_ms,
        } => {
            let cfg = RetryConfig {
                max_retries: *max_retries,
                base_delay_ms: *base_delay_ms,
            };
            let mut last: Option<ProviderError> = Option::None;
            for attempt in 0..cfg.max_attempts() {
                if attempt > 0 {
                    tokio::time::sleep(cfg.delay_for(attempt - 1)).await;
                }
                match op().await {
                    Ok(value) => return Ok(Fetched::Value(value)),
                    Err(e) => {
                        warn!(error = %e, what, attempt, "provider attempt failed");
                        last = Some(e);
                    }
                }
            }
            let cause = last.unwrap_or(ProviderError::Unavailable(what.to_string()));
            Err(FilterEvalError::with_cause(
                format!("{what} failed after {} attempts", cfg.max_attempts()),
                cause,
            ))
        }
    }
}

fn contains(haystack: &str, needle: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        haystack.contains(needle)
    } else {
        haystack.to_lowercase().contains(&needle.to_lowercase())
    }
}

fn alt_texts(post: &Post) -> Vec<String> {
    post.embed
        .as_ref()
        .map(|e| e.alt_texts().into_iter().map(str::to_string).collect())
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::providers::{StaticLinkValidator, StaticLlm, StaticTrending};
    use skygent_core::ids::{Handle, Hashtag, PostUri};
    use skygent_core::post::{Embed, EmbedImage, PostMetrics};

    fn post(rkey: &str, text: &str) -> Post {
        Post {
            uri: PostUri::new(format!("at://did:plc:a/app.bsky.feed.post/{rkey}")).unwrap(),
            cid: None,
            author: Handle::new("alice.test").unwrap(),
            author_did: None,
            text: text.into(),
            created_at: "2026-01-15T12:00:00Z".parse().unwrap(),
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
        }
    }

    fn runtime() -> FilterRuntime {
        FilterRuntime::detached()
    }

    #[tokio::test]
    async fn boolean_algebra() {
        let rt = runtime();
        let p = post("1", "hello");
        assert!(rt.evaluate(&FilterExpr::All, &p).await.unwrap());
        assert!(!rt.evaluate(&FilterExpr::None, &p).await.unwrap());
        assert!(
            rt.evaluate(&FilterExpr::and(FilterExpr::All, FilterExpr::All), &p)
                .await
                .unwrap()
        );
        assert!(
            !rt.evaluate(&FilterExpr::and(FilterExpr::All, FilterExpr::None), &p)
                .await
                .unwrap()
        );
        assert!(
            rt.evaluate(&FilterExpr::or(FilterExpr::None, FilterExpr::All), &p)
                .await
                .unwrap()
        );
        assert!(
            rt.evaluate(&FilterExpr::not(FilterExpr::None), &p)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn contains_defaults_to_case_insensitive() {
        let rt = runtime();
        let p = post("1", "Learning RUST today");
        let ci = FilterExpr::Contains {
            text: "rust".into(),
            case_sensitive: None,
        };
        let cs = FilterExpr::Contains {
            text: "rust".into(),
            case_sensitive: Some(true),
        };
        assert!(rt.evaluate(&ci, &p).await.unwrap());
        assert!(!rt.evaluate(&cs, &p).await.unwrap());
    }

    #[tokio::test]
    async fn regex_any_pattern_matches() {
        let rt = runtime();
        let p = post("1", "shipping tokio services");
        let expr = FilterExpr::Regex {
            patterns: vec!["\\bdjango\\b".into(), "\\btokio\\b".into()],
            flags: None,
        };
        assert!(rt.evaluate(&expr, &p).await.unwrap());
    }

    #[tokio::test]
    async fn hashtag_and_author_predicates() {
        let rt = runtime();
        let mut p = post("1", "post #Rust");
        p.hashtags.insert(Hashtag::new("#rust").unwrap());
        assert!(
            rt.evaluate(
                &FilterExpr::Hashtag {
                    tag: Hashtag::new("#RUST").unwrap()
                },
                &p
            )
            .await
            .unwrap()
        );
        assert!(
            rt.evaluate(
                &FilterExpr::Author {
                    handle: Handle::new("alice.test").unwrap()
                },
                &p
            )
            .await
            .unwrap()
        );
        assert!(
            !rt.evaluate(
                &FilterExpr::AuthorIn {
                    handles: vec![Handle::new("bob.test").unwrap()]
                },
                &p
            )
            .await
            .unwrap()
        );
    }

    #[tokio::test]
    async fn engagement_treats_missing_metrics_as_zero() {
        let rt = runtime();
        let mut p = post("1", "hi");
        let expr = FilterExpr::Engagement {
            min_likes: Some(5),
            min_reposts: None,
            min_replies: None,
        };
        assert!(!rt.evaluate(&expr, &p).await.unwrap());

        p.metrics = Some(PostMetrics {
            like: 5,
            ..Default::default()
        });
        assert!(rt.evaluate(&expr, &p).await.unwrap());
    }

    #[tokio::test]
    async fn image_predicates() {
        let rt = runtime();
        let mut p = post("1", "pics");
        p.embed = Some(Embed::Images {
            images: vec![
                EmbedImage {
                    alt: "a dog".into(),
                    fullsize: None,
                    thumb: None,
                },
                EmbedImage {
                    alt: String::new(),
                    fullsize: None,
                    thumb: None,
                },
            ],
        });
        assert!(rt.evaluate(&FilterExpr::HasImages, &p).await.unwrap());
        assert!(
            rt.evaluate(&FilterExpr::MinImages { min: 2 }, &p)
                .await
                .unwrap()
        );
        assert!(
            !rt.evaluate(&FilterExpr::MinImages { min: 3 }, &p)
                .await
                .unwrap()
        );
        // One image lacks alt text: NoAltText matches, HasAltText does not.
        assert!(rt.evaluate(&FilterExpr::NoAltText, &p).await.unwrap());
        assert!(!rt.evaluate(&FilterExpr::HasAltText, &p).await.unwrap());
        assert!(
            rt.evaluate(
                &FilterExpr::AltText {
                    text: "DOG".into()
                },
                &p
            )
            .await
            .unwrap()
        );
        assert!(
            rt.evaluate(
                &FilterExpr::AltTextRegex {
                    pattern: "d.g".into(),
                    flags: None
                },
                &p
            )
            .await
            .unwrap()
        );
    }

    #[tokio::test]
    async fn language_matches_primary_subtag() {
        let rt = runtime();
        let mut p = post("1", "hola");
        p.langs = vec!["es-MX".into()];
        let expr = FilterExpr::Language {
            langs: vec!["es".into()],
        };
        assert!(rt.evaluate(&expr, &p).await.unwrap());
        let expr = FilterExpr::Language {
            langs: vec!["en".into()],
        };
        assert!(!rt.evaluate(&expr, &p).await.unwrap());
    }

    #[tokio::test]
    async fn date_range_is_half_open() {
        let rt = runtime();
        let p = post("1", "x"); // created 2026-01-15T12:00:00Z
        let expr = FilterExpr::DateRange {
            start: "2026-01-15T12:00:00Z".parse().unwrap(),
            end: "2026-01-16T00:00:00Z".parse().unwrap(),
        };
        assert!(rt.evaluate(&expr, &p).await.unwrap());
        let expr = FilterExpr::DateRange {
            start: "2026-01-01T00:00:00Z".parse().unwrap(),
            end: "2026-01-15T12:00:00Z".parse().unwrap(),
        };
        assert!(!rt.evaluate(&expr, &p).await.unwrap());
    }

    #[tokio::test]
    async fn link_contains_pure_path() {
        let rt = runtime();
        let mut p = post("1", "watch this");
        p.links = vec!["https://YouTube.com/watch?v=1".into()];
        let expr = FilterExpr::LinkContains {
            text: "youtube".into(),
            case_sensitive: None,
            check_resolved: false,
            on_error: ErrorPolicy::Exclude,
        };
        // Pure path works on a detached runtime — no provider involved.
        assert!(rt.evaluate(&expr, &p).await.unwrap());
    }

    #[tokio::test]
    async fn link_contains_resolved_follows_redirects() {
        let validator = StaticLinkValidator::accepting(["https://t.co/abc"])
            .with_redirect("https://t.co/abc", "https://youtube.com/watch?v=9");
        let rt = FilterRuntime::new(validator, StaticTrending::failing(), StaticLlm::failing());
        let mut p = post("1", "watch this");
        p.links = vec!["https://t.co/abc".into()];

        let resolved = FilterExpr::LinkContains {
            text: "youtube".into(),
            case_sensitive: None,
            check_resolved: true,
            on_error: ErrorPolicy::Exclude,
        };
        assert!(rt.evaluate(&resolved, &p).await.unwrap());

        // The short link itself does not contain the needle.
        let pure = FilterExpr::LinkContains {
            text: "youtube".into(),
            case_sensitive: None,
            check_resolved: false,
            on_error: ErrorPolicy::Exclude,
        };
        assert!(!rt.evaluate(&pure, &p).await.unwrap());
    }

    #[tokio::test]
    async fn error_policy_include_and_exclude() {
        let rt = FilterRuntime::new(
            StaticLinkValidator::failing(),
            StaticTrending::failing(),
            StaticLlm::failing(),
        );
        let mut p = post("1", "link post");
        p.links = vec!["https://example.com".into()];

        let include = FilterExpr::HasValidLinks {
            on_error: ErrorPolicy::Include,
        };
        let exclude = FilterExpr::HasValidLinks {
            on_error: ErrorPolicy::Exclude,
        };
        assert!(rt.evaluate(&include, &p).await.unwrap());
        assert!(!rt.evaluate(&exclude, &p).await.unwrap());
    }

    #[tokio::test]
    async fn error_policy_retry_exhausts() {
        let validator = StaticLinkValidator::failing();
        let rt = FilterRuntime::new(
            validator.clone(),
            StaticTrending::failing(),
            StaticLlm::failing(),
        );
        let mut p = post("1", "link post");
        p.links = vec!["https://example.com".into()];

        let expr = FilterExpr::HasValidLinks {
            on_error: ErrorPolicy::Retry {
                max_retries: 2,
                base_delay_ms: 0,
            },
        };
        let err = rt.evaluate(&expr, &p).await.unwrap_err();
        assert!(err.message.contains("after 3 attempts"));
        assert_eq!(validator.call_count(), 3);
    }

    #[tokio::test]
    async fn has_valid_links_requires_all_valid() {
        let validator = StaticLinkValidator::accepting(["https://good.com"]);
        let rt = FilterRuntime::new(
            validator,
            StaticTrending::failing(),
            StaticLlm::failing(),
        );
        let expr = FilterExpr::HasValidLinks {
            on_error: ErrorPolicy::Exclude,
        };

        let mut good = post("1", "x");
        good.links = vec!["https://good.com".into()];
        assert!(rt.evaluate(&expr, &good).await.unwrap());

        let mut mixed = post("2", "x");
        mixed.links = vec!["https://good.com".into(), "https://dead.com".into()];
        assert!(!rt.evaluate(&expr, &mixed).await.unwrap());

        // No links at all: no match, and no provider call either.
        let bare = post("3", "x");
        assert!(!rt.evaluate(&expr, &bare).await.unwrap());
    }

    #[tokio::test]
    async fn trending_checks_membership() {
        let rt = FilterRuntime::new(
            StaticLinkValidator::failing(),
            StaticTrending::with_tags(["#Rust", "ai"]),
            StaticLlm::failing(),
        );
        let p = post("1", "whatever");
        let hit = FilterExpr::Trending {
            tag: Hashtag::new("#rust").unwrap(),
            on_error: ErrorPolicy::Exclude,
        };
        let miss = FilterExpr::Trending {
            tag: Hashtag::new("#cobol").unwrap(),
            on_error: ErrorPolicy::Exclude,
        };
        assert!(rt.evaluate(&hit, &p).await.unwrap());
        assert!(!rt.evaluate(&miss, &p).await.unwrap());
    }

    #[tokio::test]
    async fn llm_classification_respects_confidence_floor() {
        let rt = FilterRuntime::new(
            StaticLinkValidator::failing(),
            StaticTrending::failing(),
            StaticLlm::with_confidence(0.7),
        );
        let p = post("1", "deep dive on databases");
        let passing = FilterExpr::Llm {
            prompt: "databases".into(),
            min_confidence: 0.5,
            on_error: ErrorPolicy::Exclude,
        };
        let too_strict = FilterExpr::Llm {
            prompt: "databases".into(),
            min_confidence: 0.9,
            on_error: ErrorPolicy::Exclude,
        };
        assert!(rt.evaluate(&passing, &p).await.unwrap());
        assert!(!rt.evaluate(&too_strict, &p).await.unwrap());
    }

    #[tokio::test]
    async fn batch_coalesces_provider_calls() {
        let llm = StaticLlm::with_confidence(1.0);
        let trending = StaticTrending::with_tags(["rust"]);
        let validator = StaticLinkValidator::accepting(["https://a.com", "https://b.com"]);
        let rt = FilterRuntime::new(validator.clone(), trending.clone(), llm.clone());

        let mut posts = Vec::new();
        for i in 0..10 {
            let mut p = post(&i.to_string(), &format!("post {i} about rust"));
            p.links = vec![if i % 2 == 0 {
                "https://a.com".into()
            } else {
                "https://b.com".into()
            }];
            posts.push(p);
        }

        let expr = FilterExpr::and(
            FilterExpr::HasValidLinks {
                on_error: ErrorPolicy::Exclude,
            },
            FilterExpr::and(
                FilterExpr::Trending {
                    tag: Hashtag::new("#rust").unwrap(),
                    on_error: ErrorPolicy::Exclude,
                },
                FilterExpr::Llm {
                    prompt: "rust".into(),
                    min_confidence: 0.5,
                    on_error: ErrorPolicy::Exclude,
                },
            ),
        );
        let results = rt.evaluate_batch(&expr, &posts).await.unwrap();
        assert!(results.iter().all(|&b| b));
        // One provider call per effectful node for the whole batch.
        assert_eq!(validator.call_count(), 1);
        assert_eq!(trending.call_count(), 1);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn short_circuit_skips_effectful_nodes() {
        let validator = StaticLinkValidator::failing();
        let rt = FilterRuntime::new(
            validator.clone(),
            StaticTrending::failing(),
            StaticLlm::failing(),
        );
        let mut p = post("1", "x");
        p.links = vec!["https://example.com".into()];
        // Left is true, right would explode with Retry — but is never reached.
        let expr = FilterExpr::or(
            FilterExpr::All,
            FilterExpr::HasValidLinks {
                on_error: ErrorPolicy::Retry {
                    max_retries: 0,
                    base_delay_ms: 0,
                },
            },
        );
        assert!(rt.evaluate(&expr, &p).await.unwrap());
        assert_eq!(validator.call_count(), 0);
    }

    #[tokio::test]
    async fn single_batch_and_explain_agree() {
        let rt = FilterRuntime::new(
            StaticLinkValidator::accepting(["https://a.com"]),
            StaticTrending::with_tags(["rust"]),
            StaticLlm::with_confidence(0.9),
        );
        let mut p = post("1", "rust post");
        p.links = vec!["https://a.com".into()];
        p.hashtags.insert(Hashtag::new("#rust").unwrap());

        let exprs = [
            FilterExpr::All,
            FilterExpr::Hashtag {
                tag: Hashtag::new("#rust").unwrap(),
            },
            FilterExpr::and(
                FilterExpr::HasValidLinks {
                    on_error: ErrorPolicy::Exclude,
                },
                FilterExpr::not(FilterExpr::IsReply),
            ),
            FilterExpr::Llm {
                prompt: "rust".into(),
                min_confidence: 0.5,
                on_error: ErrorPolicy::Exclude,
            },
        ];
        for expr in &exprs {
            let single = rt.evaluate(expr, &p).await.unwrap();
            let batch = rt.evaluate_batch(expr, std::slice::from_ref(&p)).await.unwrap()[0];
            let explained = rt.explain(expr, &p).await.unwrap().ok;
            assert_eq!(single, batch, "single/batch diverged on {expr:?}");
            assert_eq!(single, explained, "single/explain diverged on {expr:?}");
        }
    }

    #[tokio::test]
    async fn explain_reports_each_node_in_preorder() {
        let rt = runtime();
        let mut p = post("1", "rust post");
        p.hashtags.insert(Hashtag::new("#rust").unwrap());
        let expr = FilterExpr::and(
            FilterExpr::Hashtag {
                tag: Hashtag::new("#rust").unwrap(),
            },
            FilterExpr::not(FilterExpr::IsReply),
        );
        let explanation = rt.explain(&expr, &p).await.unwrap();
        assert!(explanation.ok);
        let tags: Vec<&str> = explanation.reasons.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, vec!["And", "Hashtag", "Not", "IsReply"]);
        assert_eq!(
            explanation.reasons.iter().map(|r| r.ok).collect::<Vec<_>>(),
            vec![true, true, true, false]
        );
    }

    #[tokio::test]
    async fn explain_absorbs_errors_in_skipped_branches() {
        let rt = FilterRuntime::new(
            StaticLinkValidator::failing(),
            StaticTrending::failing(),
            StaticLlm::failing(),
        );
        let mut p = post("1", "x");
        p.links = vec!["https://example.com".into()];
        let expr = FilterExpr::or(
            FilterExpr::All,
            FilterExpr::HasValidLinks {
                on_error: ErrorPolicy::Retry {
                    max_retries: 0,
                    base_delay_ms: 0,
                },
            },
        );
        let explanation = rt.explain(&expr, &p).await.unwrap();
        assert!(explanation.ok);
        let failing_node = &explanation.reasons[2];
        assert_eq!(failing_node.tag, "HasValidLinks");
        assert!(!failing_node.ok);
        assert!(failing_node.detail.as_deref().unwrap().contains("attempts"));
    }

    #[tokio::test]
    async fn pure_expressions_never_touch_providers() {
        // A detached runtime fails loudly if any provider is called without
        // a policy; a pure expression must therefore evaluate cleanly.
        let rt = runtime();
        let mut p = post("1", "pure #rust");
        p.hashtags.insert(Hashtag::new("#rust").unwrap());
        let expr = FilterExpr::and(
            FilterExpr::Hashtag {
                tag: Hashtag::new("#rust").unwrap(),
            },
            FilterExpr::or(FilterExpr::IsOriginal, FilterExpr::HasMedia),
        );
        assert!(rt.evaluate(&expr, &p).await.unwrap());
    }
}
