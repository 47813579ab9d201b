//! Cache maintenance: TTL expiry and store-driven orphan removal.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument};

use skygent_core::event::Event;
use skygent_core::post::Embed;
use skygent_store::store::Store;

use crate::cache::{ImageCache, MetaRecord, content_key};
use crate::errors::ImageError;

/// Outcome of a TTL sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Meta records examined.
    pub scanned: u64,
    /// Assets removed (bytes + meta).
    pub deleted: u64,
}

/// Outcome of an orphan sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanReport {
    /// URLs still referenced by the store's events.
    pub referenced: u64,
    /// Unreferenced content keys found on disk.
    pub orphans: Vec<String>,
    /// Whether the orphans were deleted (`--remove`).
    pub removed: bool,
}

/// Delete every asset whose entry has outlived `ttl`. A zero TTL deletes
/// everything. Expired negative entries are dropped too.
#[instrument(skip(cache))]
pub fn ttl_sweep(cache: &ImageCache, ttl: Duration) -> Result<SweepReport, ImageError> {
    let meta_dir = cache.root().join("meta");
    let mut report = SweepReport::default();
    if !meta_dir.exists() {
        return Ok(report);
    }
    let now = chrono::Utc::now();

    for entry in std::fs::read_dir(&meta_dir).map_err(|e| ImageError::io(&meta_dir, e))? {
        let entry = entry.map_err(|e| ImageError::io(&meta_dir, e))?;
        let path = entry.path();
        let Some(key) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
        else {
            continue;
        };
        report.scanned += 1;

        let stale = match cache.read_meta(&key)? {
            Some(MetaRecord::Cached { fetched_at, .. }) => {
                ttl.is_zero()
                    || now.signed_duration_since(fetched_at)
                        >= chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
            }
            Some(MetaRecord::Failed { .. }) | None => true,
        };
        if stale {
            remove_asset(cache, &key)?;
            report.deleted += 1;
        }
    }
    debug!(scanned = report.scanned, deleted = report.deleted, "ttl sweep done");
    Ok(report)
}

/// Diff the cache against the image URLs referenced by a store's
/// `PostUpsert` events; delete unreferenced assets when `remove`.
#[instrument(skip(cache, store), fields(store = %store.name()))]
pub fn orphan_sweep(
    cache: &ImageCache,
    store: &Store,
    remove: bool,
) -> Result<OrphanReport, ImageError> {
    let mut referenced: HashSet<String> = HashSet::new();
    for record in store.events() {
        let record = record.map_err(|e| ImageError::Scan(e.to_string()))?;
        if let Event::PostUpsert { post, .. } = &record.event {
            if let Some(embed) = &post.embed {
                for url in embed_image_urls(embed) {
                    let _ = referenced.insert(content_key(&url));
                }
            }
        }
    }

    let mut orphans: Vec<String> = Vec::new();
    for tier in ["originals", "thumb"] {
        let dir = cache.root().join(tier);
        if !dir.exists() {
            continue;
        }
        for entry in std::fs::read_dir(&dir).map_err(|e| ImageError::io(&dir, e))? {
            let entry = entry.map_err(|e| ImageError::io(&dir, e))?;
            let Some(key) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !referenced.contains(&key) && !orphans.contains(&key) {
                orphans.push(key);
            }
        }
    }
    orphans.sort();

    if remove {
        for key in &orphans {
            remove_asset(cache, key)?;
        }
    }
    debug!(
        referenced = referenced.len(),
        orphans = orphans.len(),
        removed = remove,
        "orphan sweep done"
    );
    Ok(OrphanReport {
        referenced: referenced.len() as u64,
        orphans,
        removed: remove,
    })
}

/// Every image URL an embed references (fullsize, thumbs, posters).
fn embed_image_urls(embed: &Embed) -> Vec<String> {
    match embed {
        Embed::Images { images } => images
            .iter()
            .flat_map(|img| [img.fullsize.clone(), img.thumb.clone()])
            .flatten()
            .collect(),
        Embed::External { thumb, .. } => thumb.clone().into_iter().collect(),
        Embed::Video { thumbnail, .. } => thumbnail.clone().into_iter().collect(),
        Embed::RecordWithMedia { media, .. } => embed_image_urls(media),
        Embed::Record { .. } | Embed::Unknown { .. } => Vec::new(),
    }
}

fn remove_asset(cache: &ImageCache, key: &str) -> Result<(), ImageError> {
    for tier in ["originals", "thumb"] {
        let dir = cache.root().join(tier).join(key);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| ImageError::io(&dir, e))?;
        }
    }
    let meta = cache.meta_path(key);
    match std::fs::remove_file(&meta) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ImageError::io(&meta, e)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
