//! The derivation engine: replay a source store's event log through a
//! filter into a target store.
//!
//! Replay preserves source order. Deletes propagate unconditionally;
//! upserts are dedup-checked against the target, then filtered. The
//! checkpoint pins the filter signature and evaluation mode — changing
//! either requires `--reset`, which rebuilds the target from scratch.
//!
//! Durability: events commit first, the checkpoint trails them. A crash
//! between the two replays a suffix of events on the next run, which the
//! committer's URI-dedup absorbs.

use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use skygent_core::event::{Event, EventRecord};
use skygent_core::ids::StoreName;
use skygent_core::post::Post;
use skygent_filter::{FilterExpr, FilterRuntime, compile, filter_signature, is_effectful};
use skygent_store::checkpoints::DerivationCheckpointStore;
use skygent_store::lineage::LineageStore;
use skygent_store::store::{Store, StoreManager};
use skygent_store::types::{DerivationCheckpoint, EvaluationMode, LineageSource};

use crate::errors::DerivationError;

const REPLAY_PAGE_SIZE: usize = 200;

/// Derivation tuning knobs.
#[derive(Clone, Debug)]
pub struct DeriveOptions {
    /// Pure-only (`EventTime`) or effectful (`DeriveTime`) evaluation.
    pub mode: EvaluationMode,
    /// Clear the target and start over.
    pub reset: bool,
    /// Checkpoint after this many events…
    pub checkpoint_every: u64,
    /// …or after this much time, whichever comes first.
    pub checkpoint_interval: Duration,
    /// Cooperative cancellation, checked between pages.
    pub cancel: CancellationToken,
}

impl Default for DeriveOptions {
    fn default() -> Self {
        Self {
            mode: EvaluationMode::EventTime,
            reset: false,
            checkpoint_every: 100,
            checkpoint_interval: Duration::from_millis(5000),
            cancel: CancellationToken::new(),
        }
    }
}

/// Outcome of one derive run (this run only; the checkpoint accumulates
/// lifetime counts).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeriveResult {
    /// Source events examined.
    pub events_processed: u64,
    /// Upserts that matched and committed.
    pub events_matched: u64,
    /// Deletes propagated.
    pub deletes_propagated: u64,
    /// Upserts skipped (already present or filtered out).
    pub events_skipped: u64,
}

/// Replay `source` into `target` through `filter`.
#[instrument(skip(manager, filter, runtime, options), fields(source = %source_name, target = %target_name, mode = %options.mode))]
pub async fn derive(
    manager: &StoreManager,
    source_name: &StoreName,
    target_name: &StoreName,
    filter: &FilterExpr,
    runtime: &FilterRuntime,
    options: &DeriveOptions,
) -> Result<DeriveResult, DerivationError> {
    if source_name == target_name {
        return Err(DerivationError::SameStore);
    }
    let _ = compile(filter)?;
    if options.mode == EvaluationMode::EventTime && is_effectful(filter) {
        return Err(DerivationError::EffectfulFilter);
    }
    let filter_hash = filter_signature(filter);

    let source = manager.get(source_name)?;
    let target = manager.ensure(target_name)?;
    let checkpoints = DerivationCheckpointStore::new(manager.root().clone());
    let lineages = LineageStore::new(manager.root().clone());

    if options.reset {
        debug!("reset: clearing target and checkpoint");
        target.clear()?;
        let _ = checkpoints.remove(target_name, source_name)?;
    }

    let existing = checkpoints.load(target_name, source_name)?;
    if let Some(cp) = &existing {
        if cp.filter_hash != filter_hash || cp.evaluation_mode != options.mode {
            return Err(DerivationError::SettingsChanged {
                target: target_name.clone(),
            });
        }
    } else if target.event_count()? > 0 {
        // Someone else's events live in the target; replaying over them
        // would silently interleave histories.
        return Err(DerivationError::SettingsChanged {
            target: target_name.clone(),
        });
    }

    let mut checkpoint = existing.unwrap_or(DerivationCheckpoint {
        view_name: target_name.clone(),
        source_store: source_name.clone(),
        target_store: target_name.clone(),
        filter_hash: filter_hash.clone(),
        evaluation_mode: options.mode,
        last_source_event_id: None,
        events_processed: 0,
        events_matched: 0,
        deletes_propagated: 0,
        updated_at: chrono::Utc::now(),
    });

    let mut result = DeriveResult::default();
    let mut stream = source.events_after(checkpoint.last_source_event_id);
    let mut since_checkpoint = 0u64;
    let mut last_flush = Instant::now();

    loop {
        let mut page = Vec::with_capacity(REPLAY_PAGE_SIZE);
        for record in stream.by_ref().take(REPLAY_PAGE_SIZE) {
            page.push(record?);
        }
        if page.is_empty() {
            break;
        }

        replay_page(&target, source_name, filter, runtime, &page, &mut result).await?;

        let last = page.last().map(|r| r.id);
        checkpoint.last_source_event_id = last.or(checkpoint.last_source_event_id);
        since_checkpoint += page.len() as u64;

        if since_checkpoint >= options.checkpoint_every
            || last_flush.elapsed() >= options.checkpoint_interval
        {
            save_checkpoint(&checkpoints, &mut checkpoint, &result)?;
            since_checkpoint = 0;
            last_flush = Instant::now();
        }

        if options.cancel.is_cancelled() {
            debug!("derive cancelled between pages");
            break;
        }
    }

    save_checkpoint(&checkpoints, &mut checkpoint, &result)?;
    let now = chrono::Utc::now();
    let _ = lineages.upsert_source(
        target_name,
        LineageSource {
            store_name: source_name.clone(),
            filter: filter.clone(),
            filter_hash,
            evaluation_mode: options.mode,
            derived_at: now,
        },
        now,
    )?;

    counter!("skygent_derive_events_processed").increment(result.events_processed);
    counter!("skygent_derive_events_matched").increment(result.events_matched);
    debug!(
        processed = result.events_processed,
        matched = result.events_matched,
        deletes = result.deletes_propagated,
        "derive finished"
    );
    Ok(result)
}

/// Replay one page, preserving source order.
async fn replay_page(
    target: &Store,
    source_name: &StoreName,
    filter: &FilterExpr,
    runtime: &FilterRuntime,
    page: &[EventRecord],
    result: &mut DeriveResult,
) -> Result<(), DerivationError> {
    // Filter only the upserts the target does not already hold — posts
    // already present are skipped without evaluation.
    let mut candidates: Vec<&Post> = Vec::new();
    for record in page {
        if let Event::PostUpsert { post, .. } = &record.event {
            if !target.has_uri(&post.uri)? {
                candidates.push(post);
            }
        }
    }
    let posts: Vec<Post> = candidates.iter().map(|p| (*p).clone()).collect();
    let verdicts = runtime.evaluate_batch(filter, &posts).await?;
    let verdict_for = |uri: &str| -> Option<bool> {
        candidates
            .iter()
            .position(|p| p.uri.as_str() == uri)
            .map(|i| verdicts[i])
    };

    for record in page {
        result.events_processed += 1;
        match &record.event {
            Event::PostDelete { uri, meta } => {
                let mut meta = meta.clone();
                meta.source_store = Some(source_name.clone());
                let _ = target.append_delete(Event::PostDelete {
                    uri: uri.clone(),
                    meta,
                })?;
                result.deletes_propagated += 1;
            }
            Event::PostUpsert { post, meta } => {
                match verdict_for(post.uri.as_str()) {
                    Some(true) => {
                        let mut meta = meta.clone();
                        meta.source_store = Some(source_name.clone());
                        let committed = target.append_upsert_if_missing(Event::PostUpsert {
                            post: post.clone(),
                            meta,
                        })?;
                        if committed.is_some() {
                            result.events_matched += 1;
                        } else {
                            result.events_skipped += 1;
                        }
                    }
                    Some(false) => result.events_skipped += 1,
                    // Not a candidate: the target already had the URI.
                    None => result.events_skipped += 1,
                }
            }
        }
    }
    Ok(())
}

fn save_checkpoint(
    store: &DerivationCheckpointStore,
    checkpoint: &mut DerivationCheckpoint,
    result: &DeriveResult,
) -> Result<(), DerivationError> {
    // The checkpoint carries lifetime counts: base (loaded) + this run.
    let mut snapshot = checkpoint.clone();
    snapshot.events_processed += result.events_processed;
    snapshot.events_matched += result.events_matched;
    snapshot.deletes_propagated += result.deletes_propagated;
    snapshot.updated_at = chrono::Utc::now();
    store.save(&snapshot).map_err(DerivationError::Store)?;
    checkpoint.last_source_event_id = snapshot.last_source_event_id;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use skygent_core::event::EventMeta;
    use skygent_core::ids::{Handle, PostUri};
    use skygent_filter::ErrorPolicy;
    use skygent_store::{StoreManager, StoreRoot};
    use std::collections::BTreeSet;

    fn setup() -> (tempfile::TempDir, StoreManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = StoreManager::new(StoreRoot::new(dir.path()));
        (dir, manager)
    }

    fn name(s: &str) -> StoreName {
        StoreName::new(s).unwrap()
    }

    fn post(rkey: &str, text: &str) -> Post {
        Post {
            uri: PostUri::new(format!("at://did:plc:a/app.bsky.feed.post/{rkey}")).unwrap(),
            cid: None,
            author: Handle::new("alice.test").unwrap(),
            author_did: None,
            text: text.into(),
            created_at: "2026-01-01T00:00:00Z".parse().unwrap(),
            hashtags: BTreeSet::new(),
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

    fn upsert(rkey: &str, text: &str) -> Event {
        Event::PostUpsert {
            post: post(rkey, text),
            meta: EventMeta::now("timeline"),
        }
    }

    fn delete(rkey: &str) -> Event {
        Event::PostDelete {
            uri: PostUri::new(format!("at://did:plc:a/app.bsky.feed.post/{rkey}")).unwrap(),
            meta: EventMeta::now("timeline"),
        }
    }

    fn contains(text: &str) -> FilterExpr {
        FilterExpr::Contains {
            text: text.into(),
            case_sensitive: None,
        }
    }

    #[tokio::test]
    async fn basic_replay_filters_and_stamps_provenance() {
        let (_dir, manager) = setup();
        let src = manager.ensure(&name("src")).unwrap();
        src.append_upsert(upsert("1", "about rust")).unwrap();
        src.append_upsert(upsert("2", "about knitting")).unwrap();
        src.append_upsert(upsert("3", "rust again")).unwrap();

        let result = derive(
            &manager,
            &name("src"),
            &name("tgt"),
            &contains("rust"),
            &FilterRuntime::detached(),
            &DeriveOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.events_processed, 3);
        assert_eq!(result.events_matched, 2);
        assert_eq!(result.events_skipped, 1);

        let tgt = manager.get(&name("tgt")).unwrap();
        assert_eq!(tgt.post_count().unwrap(), 2);
        let record = tgt.events().next().unwrap().unwrap();
        assert_eq!(
            record.event.meta().source_store.as_ref().unwrap(),
            &name("src")
        );
    }

    #[tokio::test]
    async fn incremental_derive_resumes_from_checkpoint() {
        let (_dir, manager) = setup();
        let src = manager.ensure(&name("src")).unwrap();
        src.append_upsert(upsert("1", "rust one")).unwrap();

        let options = DeriveOptions::default();
        let rt = FilterRuntime::detached();
        let first = derive(&manager, &name("src"), &name("tgt"), &contains("rust"), &rt, &options)
            .await
            .unwrap();
        assert_eq!(first.events_processed, 1);

        src.append_upsert(upsert("2", "rust two")).unwrap();
        let second = derive(&manager, &name("src"), &name("tgt"), &contains("rust"), &rt, &options)
            .await
            .unwrap();
        // Only the new event was examined.
        assert_eq!(second.events_processed, 1);
        assert_eq!(second.events_matched, 1);

        let tgt = manager.get(&name("tgt")).unwrap();
        assert_eq!(tgt.post_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn deletes_propagate_unconditionally() {
        let (_dir, manager) = setup();
        let src = manager.ensure(&name("src")).unwrap();
        src.append_upsert(upsert("1", "rust post")).unwrap();
        src.append_upsert(upsert("2", "knitting post")).unwrap();
        src.append_delete(delete("1")).unwrap();
        // This delete's post never matched the filter; it propagates anyway
        // and is a no-op on the target.
        src.append_delete(delete("2")).unwrap();

        let result = derive(
            &manager,
            &name("src"),
            &name("tgt"),
            &contains("rust"),
            &FilterRuntime::detached(),
            &DeriveOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.deletes_propagated, 2);
        let tgt = manager.get(&name("tgt")).unwrap();
        assert_eq!(tgt.post_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_same_store() {
        let (_dir, manager) = setup();
        let _ = manager.ensure(&name("src")).unwrap();
        let err = derive(
            &manager,
            &name("src"),
            &name("src"),
            &FilterExpr::All,
            &FilterRuntime::detached(),
            &DeriveOptions::default(),
        )
        .await
        .unwrap_err();
        assert_matches::assert_matches!(err, DerivationError::SameStore);
    }

    #[tokio::test]
    async fn event_time_rejects_effectful_filters() {
        let (_dir, manager) = setup();
        let _ = manager.ensure(&name("src")).unwrap();
        let effectful = FilterExpr::HasValidLinks {
            on_error: ErrorPolicy::Include,
        };
        let err = derive(
            &manager,
            &name("src"),
            &name("tgt"),
            &effectful,
            &FilterRuntime::detached(),
            &DeriveOptions::default(),
        )
        .await
        .unwrap_err();
        assert_matches::assert_matches!(err, DerivationError::EffectfulFilter);

        // DeriveTime accepts the same filter.
        let options = DeriveOptions {
            mode: EvaluationMode::DeriveTime,
            ..Default::default()
        };
        derive(
            &manager,
            &name("src"),
            &name("tgt"),
            &effectful,
            &FilterRuntime::detached(),
            &options,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn changed_filter_requires_reset() {
        let (_dir, manager) = setup();
        let src = manager.ensure(&name("src")).unwrap();
        src.append_upsert(upsert("1", "rust")).unwrap();
        let rt = FilterRuntime::detached();

        derive(
            &manager,
            &name("src"),
            &name("tgt"),
            &contains("rust"),
            &rt,
            &DeriveOptions::default(),
        )
        .await
        .unwrap();

        let err = derive(
            &manager,
            &name("src"),
            &name("tgt"),
            &contains("golang"),
            &rt,
            &DeriveOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("use --reset"));

        // With reset the new filter applies cleanly.
        let options = DeriveOptions {
            reset: true,
            ..Default::default()
        };
        let result = derive(&manager, &name("src"), &name("tgt"), &contains("golang"), &rt, &options)
            .await
            .unwrap();
        assert_eq!(result.events_matched, 0);
        assert_eq!(manager.get(&name("tgt")).unwrap().post_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn target_with_foreign_events_requires_reset() {
        let (_dir, manager) = setup();
        let src = manager.ensure(&name("src")).unwrap();
        src.append_upsert(upsert("1", "x")).unwrap();
        let tgt = manager.ensure(&name("tgt")).unwrap();
        tgt.append_upsert(upsert("99", "someone else's data")).unwrap();

        let err = derive(
            &manager,
            &name("src"),
            &name("tgt"),
            &FilterExpr::All,
            &FilterRuntime::detached(),
            &DeriveOptions::default(),
        )
        .await
        .unwrap_err();
        assert_matches::assert_matches!(err, DerivationError::SettingsChanged { .. });
    }

    #[tokio::test]
    async fn reset_derive_is_deterministic() {
        let (_dir, manager) = setup();
        let src = manager.ensure(&name("src")).unwrap();
        for i in 0..10 {
            let text = if i % 2 == 0 { "rust" } else { "other" };
            src.append_upsert(upsert(&i.to_string(), text)).unwrap();
        }
        let rt = FilterRuntime::detached();
        let options = DeriveOptions {
            reset: true,
            ..Default::default()
        };

        let mut runs = Vec::new();
        for _ in 0..2 {
            derive(&manager, &name("src"), &name("tgt"), &contains("rust"), &rt, &options)
                .await
                .unwrap();
            let tgt = manager.get(&name("tgt")).unwrap();
            let uris: Vec<String> = tgt
                .events()
                .map(|r| r.unwrap().event.uri().to_string())
                .collect();
            runs.push(uris);
        }
        assert_eq!(runs[0], runs[1]);
        assert_eq!(runs[0].len(), 5);
    }

    #[tokio::test]
    async fn lineage_and_staleness() {
        let (_dir, manager) = setup();
        let src = manager.ensure(&name("src")).unwrap();
        src.append_upsert(upsert("1", "rust")).unwrap();
        let rt = FilterRuntime::detached();

        derive(
            &manager,
            &name("src"),
            &name("tgt"),
            &contains("rust"),
            &rt,
            &DeriveOptions::default(),
        )
        .await
        .unwrap();

        let lineage = LineageStore::new(manager.root().clone())
            .get(&name("tgt"))
            .unwrap()
            .unwrap();
        assert!(lineage.is_derived);
        assert_eq!(lineage.sources.len(), 1);
        assert_eq!(lineage.sources[0].store_name, name("src"));
        assert_eq!(
            lineage.sources[0].filter_hash,
            filter_signature(&contains("rust"))
        );

        // Fresh after derive…
        let stats = manager.stats(&name("tgt")).unwrap();
        assert!(stats.is_derived);
        assert!(!stats.stale);

        // …stale as soon as the source advances.
        src.append_upsert(upsert("2", "more rust")).unwrap();
        let stats = manager.stats(&name("tgt")).unwrap();
        assert!(stats.stale);

        // Deriving again clears staleness.
        derive(
            &manager,
            &name("src"),
            &name("tgt"),
            &contains("rust"),
            &rt,
            &DeriveOptions::default(),
        )
        .await
        .unwrap();
        assert!(!manager.stats(&name("tgt")).unwrap().stale);
    }

    #[tokio::test]
    async fn checkpoint_counts_accumulate_across_runs() {
        let (_dir, manager) = setup();
        let src = manager.ensure(&name("src")).unwrap();
        src.append_upsert(upsert("1", "rust")).unwrap();
        let rt = FilterRuntime::detached();

        derive(&manager, &name("src"), &name("tgt"), &contains("rust"), &rt, &DeriveOptions::default())
            .await
            .unwrap();
        src.append_upsert(upsert("2", "rust")).unwrap();
        derive(&manager, &name("src"), &name("tgt"), &contains("rust"), &rt, &DeriveOptions::default())
            .await
            .unwrap();

        let cp = DerivationCheckpointStore::new(manager.root().clone())
            .load(&name("tgt"), &name("src"))
            .unwrap()
            .unwrap();
        assert_eq!(cp.events_processed, 2);
        assert_eq!(cp.events_matched, 2);
        assert_eq!(cp.last_source_event_id, src.last_event_id().unwrap());
    }
}
