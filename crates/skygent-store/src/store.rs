//! The [`Store`] facade and [`StoreManager`] lifecycle.
//!
//! `Store` is the single narrow waist through which the sync and derivation
//! engines reach a store's database. All write methods run inside a single
//! transaction behind a per-store write lock, so concurrent tasks writing
//! to the same store serialize while writes to different stores proceed in
//! parallel.
//!
//! INVARIANT: the ULID generator lives inside the write lock, so event ids
//! are unique and strictly increasing per store even when two appends land
//! in the same millisecond.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, instrument, warn};

use skygent_core::event::{Event, EventRecord};
use skygent_core::ids::{EventId, EventIdGenerator, Hashtag, PostUri, StoreName};
use skygent_core::post::Post;

use crate::checkpoints::DerivationCheckpointStore;
use crate::errors::{Result, StoreError};
use crate::lineage::LineageStore;
use crate::paths::StoreRoot;
use crate::sqlite::repositories::checkpoint::CheckpointRepo;
use crate::sqlite::repositories::event_log::{EventLogRepo, STREAM_PAGE_SIZE};
use crate::sqlite::repositories::posts::{PostIndexRepo, SCAN_PAGE_SIZE};
use crate::sqlite::{ConnectionPool, open_pool};
use crate::types::{
    SearchPage, SearchQuery, StoreQuery, StoreStats, SyncCheckpoint, ThreadGroup,
};

const SQLITE_BUSY_MAX_RETRIES: u32 = 32;

/// Retry an operation on `SQLite` BUSY/LOCKED with linear backoff + jitter.
fn retry_on_busy<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempts = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy_or_locked(&err) && attempts < SQLITE_BUSY_MAX_RETRIES => {
                attempts += 1;
                let base_ms = u64::from(attempts).saturating_mul(10).min(500);
                let jitter_range = base_ms / 4;
                let jitter = if jitter_range > 0 {
                    rand::random::<u64>() % (jitter_range * 2 + 1)
                } else {
                    0
                };
                let backoff_ms = base_ms.saturating_sub(jitter_range) + jitter;
                std::thread::sleep(Duration::from_millis(backoff_ms));
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_busy_or_locked(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

/// One opened store: pool + serialized write state.
#[derive(Debug)]
pub struct Store {
    name: StoreName,
    pool: ConnectionPool,
    write: Mutex<EventIdGenerator>,
}

impl Store {
    /// Wrap an opened pool, seeding the id generator from the log head so
    /// restarts stay monotone.
    pub fn new(name: StoreName, pool: ConnectionPool) -> Result<Self> {
        let conn = pool.get()?;
        let generator = match EventLogRepo::last_event_id(&conn)? {
            Some(last) => EventIdGenerator::seeded(last),
            None => EventIdGenerator::new(),
        };
        drop(conn);
        Ok(Self {
            name,
            pool,
            write: Mutex::new(generator),
        })
    }

    /// The store's name.
    pub fn name(&self) -> &StoreName {
        &self.name
    }

    /// Run a read-only closure on a pooled connection.
    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.pool.get()?;
        f(&conn)
    }

    /// Run a write closure inside one transaction behind the write lock.
    fn write_tx<T>(
        &self,
        mut f: impl FnMut(&Connection, &mut EventIdGenerator) -> Result<T>,
    ) -> Result<T> {
        let mut generator = self.write.lock();
        retry_on_busy(|| {
            let conn = self.pool.get()?;
            let tx = conn.unchecked_transaction()?;
            let value = f(&tx, &mut generator)?;
            tx.commit()?;
            Ok(value)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Event log (writer)
    // ─────────────────────────────────────────────────────────────────────

    /// Append an event to the log without touching the index.
    #[instrument(skip(self, event), fields(store = %self.name))]
    pub fn append(&self, event: Event) -> Result<EventRecord> {
        self.write_tx(move |conn, generator| {
            let record = EventRecord::new(generator.next(), event.clone());
            EventLogRepo::insert(conn, &record)?;
            Ok(record)
        })
    }

    /// Highest appended event id, `None` on an empty log.
    pub fn last_event_id(&self) -> Result<Option<EventId>> {
        self.read(|conn| EventLogRepo::last_event_id(conn))
    }

    /// Number of events in the log.
    pub fn event_count(&self) -> Result<u64> {
        self.read(|conn| EventLogRepo::count(conn))
    }

    /// Lazy ascending scan of the whole event log.
    pub fn events(&self) -> EventStream {
        EventStream::new(self.pool.clone(), None)
    }

    /// Lazy ascending scan of events strictly after `cursor`.
    pub fn events_after(&self, cursor: Option<EventId>) -> EventStream {
        EventStream::new(self.pool.clone(), cursor)
    }

    /// Admin reset: drop every event, every index row, and all meta.
    #[instrument(skip(self), fields(store = %self.name))]
    pub fn clear(&self) -> Result<()> {
        self.write_tx(|conn, _| {
            EventLogRepo::clear(conn)?;
            PostIndexRepo::clear(conn)?;
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Committer
    // ─────────────────────────────────────────────────────────────────────

    /// Append an upsert and fold it into the index, unconditionally.
    #[instrument(skip(self, event), fields(store = %self.name, uri = %event.uri()))]
    pub fn append_upsert(&self, event: Event) -> Result<EventRecord> {
        debug_assert!(event.is_upsert());
        self.write_tx(move |conn, generator| {
            let record = EventRecord::new(generator.next(), event.clone());
            EventLogRepo::insert(conn, &record)?;
            PostIndexRepo::apply(conn, &record)?;
            Ok(record)
        })
    }

    /// Append an upsert only if no live row exists for its URI.
    ///
    /// Returns `None` when the URI is already present (dedup skip). Check,
    /// append, and apply share one transaction, so two racing writers
    /// cannot both insert.
    #[instrument(skip(self, event), fields(store = %self.name, uri = %event.uri()))]
    pub fn append_upsert_if_missing(&self, event: Event) -> Result<Option<EventRecord>> {
        debug_assert!(event.is_upsert());
        // The dedup check reads the index, so it must be in sync first.
        // Runs before the write lock; the lock is not reentrant.
        self.ensure_bootstrapped()?;
        self.write_tx(move |conn, generator| {
            if PostIndexRepo::has_uri(conn, event.uri())? {
                return Ok(None);
            }
            let record = EventRecord::new(generator.next(), event.clone());
            EventLogRepo::insert(conn, &record)?;
            PostIndexRepo::apply(conn, &record)?;
            Ok(Some(record))
        })
    }

    /// Append a delete event and remove the row.
    #[instrument(skip(self, event), fields(store = %self.name, uri = %event.uri()))]
    pub fn append_delete(&self, event: Event) -> Result<EventRecord> {
        debug_assert!(!event.is_upsert());
        self.write_tx(move |conn, generator| {
            let record = EventRecord::new(generator.next(), event.clone());
            EventLogRepo::insert(conn, &record)?;
            PostIndexRepo::apply(conn, &record)?;
            Ok(record)
        })
    }

    /// Append a batch of delete events in one transaction: one append per
    /// event, one commit for all of them.
    #[instrument(skip(self, events), fields(store = %self.name, count = events.len()))]
    pub fn append_deletes(&self, events: Vec<Event>) -> Result<Vec<EventRecord>> {
        self.write_tx(move |conn, generator| {
            let mut records = Vec::with_capacity(events.len());
            for event in &events {
                let record = EventRecord::new(generator.next(), event.clone());
                EventLogRepo::insert(conn, &record)?;
                PostIndexRepo::apply(conn, &record)?;
                records.push(record);
            }
            Ok(records)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Index reads (lazy bootstrap)
    // ─────────────────────────────────────────────────────────────────────

    /// Rebuild the index from the event log. Idempotent.
    #[instrument(skip(self), fields(store = %self.name))]
    pub fn rebuild_index(&self) -> Result<u64> {
        self.write_tx(|conn, _| {
            PostIndexRepo::clear(conn)?;
            let mut cursor: Option<EventId> = None;
            let mut applied = 0u64;
            loop {
                let page = EventLogRepo::page_after(conn, cursor.as_ref(), STREAM_PAGE_SIZE)?;
                if page.is_empty() {
                    break;
                }
                for record in &page {
                    PostIndexRepo::apply(conn, record)?;
                    applied += 1;
                }
                cursor = page.last().map(|r| r.id);
            }
            Ok(applied)
        })
    }

    /// Bring the index in sync with the event log before a read.
    ///
    /// The committer applies events inline, so the marker normally equals
    /// the log head and this is one meta-row read. After a `clear`, an
    /// external log import, or a crashed rebuild the marker diverges and a
    /// rebuild runs.
    pub fn ensure_bootstrapped(&self) -> Result<()> {
        let (indexed_through, head) = self.read(|conn| {
            Ok((
                PostIndexRepo::indexed_through(conn)?,
                EventLogRepo::last_event_id(conn)?,
            ))
        })?;
        if head.is_none() || indexed_through == head {
            return Ok(());
        }
        warn!(store = %self.name, "index out of sync with event log, rebuilding");
        let _ = self.rebuild_index()?;
        Ok(())
    }

    /// Whether a live row exists for this URI.
    pub fn has_uri(&self, uri: &PostUri) -> Result<bool> {
        self.ensure_bootstrapped()?;
        self.read(|conn| PostIndexRepo::has_uri(conn, uri))
    }

    /// Count live posts.
    pub fn post_count(&self) -> Result<u64> {
        self.ensure_bootstrapped()?;
        self.read(|conn| PostIndexRepo::count(conn))
    }

    /// Fetch one post by URI.
    pub fn get_post(&self, uri: &PostUri) -> Result<Option<Post>> {
        self.ensure_bootstrapped()?;
        self.read(|conn| PostIndexRepo::get_post(conn, uri))
    }

    /// URIs of posts created on a `YYYY-MM-DD` date.
    pub fn get_by_date(&self, date: &str) -> Result<Vec<PostUri>> {
        self.ensure_bootstrapped()?;
        self.read(|conn| PostIndexRepo::get_by_date(conn, date))
    }

    /// URIs of posts carrying a hashtag.
    pub fn get_by_hashtag(&self, tag: &Hashtag) -> Result<Vec<PostUri>> {
        self.ensure_bootstrapped()?;
        self.read(|conn| PostIndexRepo::get_by_hashtag(conn, tag))
    }

    /// Lazy index scan. Pages are fetched on demand as the iterator is
    /// driven; `scan_limit` caps the total rows yielded.
    pub fn query(&self, query: StoreQuery) -> Result<PostScan> {
        self.ensure_bootstrapped()?;
        Ok(PostScan::new(self.pool.clone(), query))
    }

    /// LIKE-based substring search with an OFFSET cursor.
    pub fn search(&self, query: &SearchQuery) -> Result<SearchPage> {
        self.ensure_bootstrapped()?;
        self.read(|conn| PostIndexRepo::search(conn, query))
    }

    /// All index entries in creation order (a full scan with no filter).
    pub fn entries(&self, limit: Option<u64>) -> Result<PostScan> {
        self.query(StoreQuery {
            scan_limit: limit,
            ..Default::default()
        })
    }

    /// Reply groups by thread root, largest first.
    pub fn thread_groups(&self) -> Result<Vec<ThreadGroup>> {
        self.ensure_bootstrapped()?;
        self.read(|conn| PostIndexRepo::thread_groups(conn))
    }

    /// Posts of one thread, ascending by creation time.
    pub fn thread_posts(&self, root: &str) -> Result<Vec<Post>> {
        self.ensure_bootstrapped()?;
        self.read(|conn| PostIndexRepo::thread_posts(conn, root))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sync checkpoints
    // ─────────────────────────────────────────────────────────────────────

    /// Load the sync checkpoint for a source key.
    pub fn load_checkpoint(&self, source: &str) -> Result<Option<SyncCheckpoint>> {
        self.read(|conn| CheckpointRepo::load(conn, source))
    }

    /// Upsert a sync checkpoint (last write wins).
    pub fn save_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.write_tx(|conn, _| CheckpointRepo::save(conn, checkpoint))
    }

    /// Drop the sync checkpoint for a source key.
    pub fn remove_checkpoint(&self, source: &str) -> Result<bool> {
        self.write_tx(|conn, _| CheckpointRepo::remove(conn, source))
    }
}

/// Pull-based scan over the event log, 500 rows per page.
///
/// New rows appended while the stream is being driven appear in later
/// pages until the stream observes an empty page and finishes.
pub struct EventStream {
    pool: ConnectionPool,
    cursor: Option<EventId>,
    buffer: VecDeque<EventRecord>,
    done: bool,
}

impl EventStream {
    fn new(pool: ConnectionPool, cursor: Option<EventId>) -> Self {
        Self {
            pool,
            cursor,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let conn = self.pool.get()?;
        let page = EventLogRepo::page_after(&conn, self.cursor.as_ref(), STREAM_PAGE_SIZE)?;
        if page.is_empty() {
            self.done = true;
            return Ok(());
        }
        self.cursor = page.last().map(|r| r.id);
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for EventStream {
    type Item = Result<EventRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Lazy index scan — pages fetched as the iterator advances.
pub struct PostScan {
    pool: ConnectionPool,
    query: StoreQuery,
    buffer: VecDeque<Post>,
    yielded: u64,
    done: bool,
}

impl PostScan {
    fn new(pool: ConnectionPool, query: StoreQuery) -> Self {
        Self {
            pool,
            query,
            buffer: VecDeque::new(),
            yielded: 0,
            done: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let conn = self.pool.get()?;
        let (posts, next_cursor) = PostIndexRepo::query_page(&conn, &self.query, SCAN_PAGE_SIZE)?;
        self.buffer.extend(posts);
        match next_cursor {
            Some(cursor) => self.query.cursor = Some(cursor),
            None => self.done = true,
        }
        Ok(())
    }
}

impl Iterator for PostScan {
    type Item = Result<Post>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(limit) = self.query.scan_limit {
            if self.yielded >= limit {
                return None;
            }
        }
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
        let post = self.buffer.pop_front()?;
        self.yielded += 1;
        Some(Ok(post))
    }
}

/// Store lifecycle: open/create/list/delete/rename/stats.
///
/// Opened stores are cached so every task in the process shares one write
/// lock per store name.
pub struct StoreManager {
    root: StoreRoot,
    open: Mutex<HashMap<StoreName, Arc<Store>>>,
}

impl StoreManager {
    /// Manager over a store root.
    pub fn new(root: StoreRoot) -> Self {
        Self {
            root,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// The root this manager serves.
    pub fn root(&self) -> &StoreRoot {
        &self.root
    }

    fn open_store(&self, name: &StoreName) -> Result<Arc<Store>> {
        let mut open = self.open.lock();
        if let Some(store) = open.get(name) {
            return Ok(store.clone());
        }
        let pool = open_pool(&self.root.db_path(name))?;
        let store = Arc::new(Store::new(name.clone(), pool)?);
        let _ = open.insert(name.clone(), store.clone());
        Ok(store)
    }

    /// Create a new store. Fails if it already exists.
    #[instrument(skip(self), fields(store = %name))]
    pub fn create(&self, name: &StoreName) -> Result<Arc<Store>> {
        if self.root.store_dir(name).exists() {
            return Err(StoreError::AlreadyExists(name.clone()));
        }
        let store = self.open_store(name)?;
        debug!(store = %name, "store created");
        Ok(store)
    }

    /// Open an existing store. Fails with `NotFound` otherwise.
    pub fn get(&self, name: &StoreName) -> Result<Arc<Store>> {
        if !self.root.db_path(name).exists() {
            return Err(StoreError::NotFound(name.clone()));
        }
        self.open_store(name)
    }

    /// Open a store, creating it on first use.
    pub fn ensure(&self, name: &StoreName) -> Result<Arc<Store>> {
        self.open_store(name)
    }

    /// Names of all stores under the root, sorted.
    pub fn list(&self) -> Result<Vec<StoreName>> {
        let dir = self.root.stores_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Ok(name) = StoreName::new(entry.file_name().to_string_lossy()) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a store: its directory, cached handle, and lineage record.
    #[instrument(skip(self), fields(store = %name))]
    pub fn delete(&self, name: &StoreName) -> Result<()> {
        let dir = self.root.store_dir(name);
        if !dir.exists() {
            return Err(StoreError::NotFound(name.clone()));
        }
        let _ = self.open.lock().remove(name);
        std::fs::remove_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(())
    }

    /// Rename a store and rewrite every lineage record and derivation
    /// checkpoint that references the old name.
    #[instrument(skip(self), fields(from = %old, to = %new))]
    pub fn rename(&self, old: &StoreName, new: &StoreName) -> Result<()> {
        let old_dir = self.root.store_dir(old);
        if !old_dir.exists() {
            return Err(StoreError::NotFound(old.clone()));
        }
        let new_dir = self.root.store_dir(new);
        if new_dir.exists() {
            return Err(StoreError::AlreadyExists(new.clone()));
        }
        // Close the handle so the database files can move.
        let _ = self.open.lock().remove(old);
        std::fs::rename(&old_dir, &new_dir).map_err(|e| StoreError::io(&old_dir, e))?;

        let lineages = LineageStore::new(self.root.clone());
        lineages.rename_store(old, new)?;
        let checkpoints = DerivationCheckpointStore::new(self.root.clone());
        checkpoints.rename_store(old, new, &self.list()?)?;
        Ok(())
    }

    /// Counters and staleness for one store.
    pub fn stats(&self, name: &StoreName) -> Result<StoreStats> {
        let store = self.get(name)?;
        let posts = store.post_count()?;
        let events = store.event_count()?;
        let last_event_id = store.last_event_id()?;

        let lineages = LineageStore::new(self.root.clone());
        let lineage = lineages.get(name)?;
        let is_derived = lineage.is_some();

        let mut stale = false;
        if let Some(lineage) = &lineage {
            let checkpoints = DerivationCheckpointStore::new(self.root.clone());
            for source in &lineage.sources {
                let source_head = match self.get(&source.store_name) {
                    Ok(s) => s.last_event_id()?,
                    Err(StoreError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                let checkpoint = checkpoints.load(name, &source.store_name)?;
                let caught_up_to = checkpoint.and_then(|c| c.last_source_event_id);
                if source_head > caught_up_to {
                    stale = true;
                    break;
                }
            }
        }

        Ok(StoreStats {
            name: name.clone(),
            posts,
            events,
            last_event_id,
            is_derived,
            stale,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
