//! The sync engine: paginated ingestion from a data source into a store.
//!
//! Work is page-shaped. Items accumulate until the source emits a page
//! cursor, then the whole page is filtered in one batch (so effectful
//! predicates coalesce their provider calls) and committed post by post.
//! The checkpoint advances only after a page commits, so an interrupted
//! sync resumes at the last durable page boundary.

use futures::StreamExt;
use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use skygent_core::event::{Event, EventMeta};
use skygent_core::post::Post;
use skygent_filter::{FilterExpr, FilterRuntime, compile, filter_signature};
use skygent_store::config::SyncPolicy;
use skygent_store::store::Store;
use skygent_store::types::SyncCheckpoint;

use crate::errors::SyncError;
use crate::parser::{ParsedItem, parse_record};
use crate::source::DataSource;

/// Sync tuning knobs.
#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Dedupe (default) or refresh commits.
    pub policy: SyncPolicy,
    /// Abort on the first per-post error.
    pub strict: bool,
    /// Abort once this many per-post errors accumulate.
    pub max_errors: usize,
    /// CLI command recorded into event provenance.
    pub command: Option<String>,
    /// Cooperative cancellation, checked between pages.
    pub cancel: CancellationToken,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            policy: SyncPolicy::Dedupe,
            strict: false,
            max_errors: 25,
            command: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Outcome of one sync run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Posts committed.
    pub posts_added: u64,
    /// Deletes committed.
    pub posts_deleted: u64,
    /// Posts skipped by the filter or by dedup.
    pub posts_skipped: u64,
    /// Per-post parse/eval errors (bounded by `max_errors`).
    pub errors: Vec<String>,
}

/// Run one sync pass: pull everything the source yields, filter, commit,
/// checkpoint.
#[instrument(skip_all, fields(store = %store.name(), source = %source.descriptor().key()))]
pub async fn sync(
    source: &dyn DataSource,
    store: &Store,
    filter: &FilterExpr,
    runtime: &FilterRuntime,
    options: &SyncOptions,
) -> Result<SyncResult, SyncError> {
    let _ = compile(filter)?;
    let filter_hash = filter_signature(filter);
    let source_key = source.descriptor().key();

    // Resume only when the checkpoint was written by the same filter.
    let checkpoint = store.load_checkpoint(&source_key)?;
    let resume_cursor = checkpoint
        .filter(|cp| cp.filter_hash == filter_hash)
        .and_then(|cp| cp.cursor);
    if resume_cursor.is_some() {
        debug!(cursor = ?resume_cursor, "resuming from checkpoint");
    }

    let mut stream = source.stream(resume_cursor.clone());
    let mut result = SyncResult::default();
    let mut page: Vec<ParsedItem> = Vec::new();
    let mut last_cursor = resume_cursor;

    while let Some(item) = stream.next().await {
        let raw = item?;
        match parse_record(&raw.record) {
            Ok(parsed) => page.push(parsed),
            Err(e) => {
                warn!(error = %e, "raw post failed to parse");
                result.errors.push(e.to_string());
                check_error_budget(&result, options)?;
            }
        }
        if let Some(cursor) = raw.page_cursor {
            flush_page(store, &source_key, filter, runtime, options, &mut page, &mut result)
                .await?;
            last_cursor = Some(cursor);
            save_checkpoint(store, &source_key, &filter_hash, last_cursor.clone())?;
            if options.cancel.is_cancelled() {
                debug!("sync cancelled at page boundary");
                publish_metrics(&result);
                return Ok(result);
            }
        }
    }

    // Trailing items past the last page marker, then the final checkpoint —
    // written even when nothing matched, so ingestion advances through
    // empty filter results.
    flush_page(store, &source_key, filter, runtime, options, &mut page, &mut result).await?;
    save_checkpoint(store, &source_key, &filter_hash, last_cursor)?;

    publish_metrics(&result);
    debug!(
        added = result.posts_added,
        skipped = result.posts_skipped,
        deleted = result.posts_deleted,
        errors = result.errors.len(),
        "sync finished"
    );
    Ok(result)
}

fn check_error_budget(result: &SyncResult, options: &SyncOptions) -> Result<(), SyncError> {
    if options.strict {
        let last = result.errors.last().cloned().unwrap_or_default();
        return Err(SyncError::Aborted(format!("strict mode: {last}")));
    }
    if result.errors.len() > options.max_errors {
        return Err(SyncError::Aborted(format!(
            "error budget exhausted after {} errors",
            result.errors.len()
        )));
    }
    Ok(())
}

/// Filter one page as a batch, then commit each item in arrival order.
async fn flush_page(
    store: &Store,
    source_key: &str,
    filter: &FilterExpr,
    runtime: &FilterRuntime,
    options: &SyncOptions,
    page: &mut Vec<ParsedItem>,
    result: &mut SyncResult,
) -> Result<(), SyncError> {
    if page.is_empty() {
        return Ok(());
    }
    let items = std::mem::take(page);

    let posts: Vec<Post> = items
        .iter()
        .filter_map(|item| match item {
            ParsedItem::Upsert(post) => Some((**post).clone()),
            ParsedItem::Delete(_) => None,
        })
        .collect();
    let verdicts = match runtime.evaluate_batch(filter, &posts).await {
        Ok(verdicts) => verdicts,
        Err(e) if !options.strict => {
            // The whole page fails evaluation; count it against the error
            // budget and skip the page rather than losing the run.
            warn!(error = %e, "filter evaluation failed for page");
            result.errors.push(e.to_string());
            result.posts_skipped += posts.len() as u64;
            check_error_budget(result, options)?;
            return Ok(());
        }
        Err(e) => return Err(SyncError::FilterEval(e)),
    };

    let mut verdict_iter = verdicts.into_iter();
    for item in items {
        match item {
            ParsedItem::Delete(uri) => {
                let event = Event::PostDelete {
                    uri,
                    meta: meta_now(source_key, options),
                };
                let _ = store.append_delete(event)?;
                result.posts_deleted += 1;
            }
            ParsedItem::Upsert(post) => {
                let matched = verdict_iter.next().unwrap_or(false);
                if !matched {
                    result.posts_skipped += 1;
                    continue;
                }
                let event = Event::PostUpsert {
                    post: *post,
                    meta: meta_now(source_key, options),
                };
                match options.policy {
                    SyncPolicy::Dedupe => match store.append_upsert_if_missing(event)? {
                        Some(_) => result.posts_added += 1,
                        None => result.posts_skipped += 1,
                    },
                    SyncPolicy::Refresh => {
                        let _ = store.append_upsert(event)?;
                        result.posts_added += 1;
                    }
                }
            }
        }
    }
    Ok(())
}

fn meta_now(source_key: &str, options: &SyncOptions) -> EventMeta {
    EventMeta {
        source: source_key.to_string(),
        command: options.command.clone(),
        created_at: chrono::Utc::now(),
        source_store: None,
    }
}

fn save_checkpoint(
    store: &Store,
    source_key: &str,
    filter_hash: &str,
    cursor: Option<String>,
) -> Result<(), SyncError> {
    let checkpoint = SyncCheckpoint {
        source: source_key.to_string(),
        cursor,
        filter_hash: filter_hash.to_string(),
        last_event_id: store.last_event_id()?,
        updated_at: chrono::Utc::now(),
    };
    store.save_checkpoint(&checkpoint)?;
    Ok(())
}

fn publish_metrics(result: &SyncResult) {
    counter!("skygent_sync_posts_added").increment(result.posts_added);
    counter!("skygent_sync_posts_skipped").increment(result.posts_skipped);
    counter!("skygent_sync_posts_deleted").increment(result.posts_deleted);
    counter!("skygent_sync_errors").increment(result.errors.len() as u64);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
