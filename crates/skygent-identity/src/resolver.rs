//! The batching profile resolver.
//!
//! `handle_for_did` checks L2, then L1, then enqueues a request. The first
//! caller to enqueue becomes the drainer: it waits out a short batching
//! window, then dispatches the queue in chunks of at most
//! `profile_batch_size` DIDs, routing each result back to its waiter.
//! N concurrent misses therefore cost at most `ceil(N / batchSize)`
//! outbound requests, and cached DIDs cost none.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use skygent_core::ids::{Did, Handle};

use crate::cache::{CacheSource, IdentityCacheDb, RequestCache};
use crate::errors::IdentityError;

/// A resolved profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    /// The account's DID.
    pub did: Did,
    /// Its current handle.
    pub handle: Handle,
}

/// The network capability behind the resolver.
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    /// Batched profile fetch. Unknown DIDs are simply absent from the
    /// answer.
    async fn get_profiles(&self, dids: &[Did]) -> Result<Vec<Profile>, IdentityError>;

    /// Authoritative single-DID resolution (strict mode).
    async fn resolve_identity(&self, did: &Did) -> Result<Profile, IdentityError>;
}

/// Resolver tuning knobs.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// DIDs per outbound request, `1..=25`.
    pub batch_size: usize,
    /// L2 capacity.
    pub cache_capacity: usize,
    /// L2 TTL.
    pub cache_ttl: Duration,
    /// Batching window before a drain begins.
    pub batch_window: Duration,
    /// Resolve each DID via the authoritative endpoint.
    pub strict: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            cache_capacity: 5000,
            cache_ttl: Duration::from_secs(6 * 60 * 60),
            batch_window: Duration::from_millis(1),
            strict: false,
        }
    }
}

type Waiter = oneshot::Sender<Result<Handle, IdentityError>>;

/// Batched, cached DID→handle resolution.
pub struct ProfileResolver {
    fetcher: Arc<dyn ProfileFetcher>,
    l1: IdentityCacheDb,
    l2: RequestCache,
    config: ResolverConfig,
    pending: Mutex<Vec<(Did, Waiter)>>,
    draining: AtomicBool,
    requests: AtomicUsize,
}

impl ProfileResolver {
    /// Build a resolver over a fetcher and an opened L1 cache.
    pub fn new(
        fetcher: Arc<dyn ProfileFetcher>,
        l1: IdentityCacheDb,
        config: ResolverConfig,
    ) -> Self {
        let batch_size = config.batch_size.clamp(1, 25);
        let l2 = RequestCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            fetcher,
            l1,
            l2,
            config: ResolverConfig {
                batch_size,
                ..config
            },
            pending: Mutex::new(Vec::new()),
            draining: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
        }
    }

    /// Outbound requests made so far (test observability).
    pub fn outbound_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Record an identity seen in passing (post author, mention).
    pub fn observe(&self, did: &Did, handle: &Handle) -> Result<(), IdentityError> {
        self.l1.record(did, handle, CacheSource::Observation)?;
        Ok(())
    }

    /// `handle → did` from the persistent cache.
    pub fn did_for_handle(&self, handle: &Handle) -> Result<Option<Did>, IdentityError> {
        self.l1.lookup_did(handle)
    }

    /// Resolve a DID to its handle.
    pub async fn handle_for_did(&self, did: &Did) -> Result<Handle, IdentityError> {
        if let Some(handle) = self.l2.get(did) {
            return Ok(handle);
        }
        if let Some((handle, _verified)) = self.l1.lookup_handle(did)? {
            self.l2.put(did, handle.clone());
            return Ok(handle);
        }

        let (tx, rx) = oneshot::channel();
        let should_drain = {
            let mut pending = self.pending.lock();
            pending.push((did.clone(), tx));
            // First enqueuer while no drain is active becomes the drainer.
            !self.draining.swap(true, Ordering::SeqCst)
        };
        if should_drain {
            self.drain().await;
        }
        rx.await
            .unwrap_or_else(|_| Err(IdentityError::Network("resolver dropped request".into())))
    }

    /// Wait out the batching window, then dispatch the queue in chunks.
    async fn drain(&self) {
        loop {
            tokio::time::sleep(self.config.batch_window).await;
            let batch: Vec<(Did, Waiter)> = {
                let mut pending = self.pending.lock();
                let take = pending.len().min(self.config.batch_size);
                if take == 0 {
                    self.draining.store(false, Ordering::SeqCst);
                    return;
                }
                pending.drain(..take).collect()
            };
            debug!(size = batch.len(), "dispatching profile batch");
            self.dispatch(batch).await;
        }
    }

    async fn dispatch(&self, batch: Vec<(Did, Waiter)>) {
        if self.config.strict {
            // Strict mode: one authoritative request per DID.
            for (did, waiter) in batch {
                let _ = self.requests.fetch_add(1, Ordering::SeqCst);
                let result = match self.fetcher.resolve_identity(&did).await {
                    Ok(profile) => {
                        if let Err(e) =
                            self.l1
                                .record(&profile.did, &profile.handle, CacheSource::ResolveIdentity)
                        {
                            warn!(error = %e, "identity cache write failed");
                        }
                        self.l2.put(&profile.did, profile.handle.clone());
                        Ok(profile.handle)
                    }
                    Err(e) => Err(e),
                };
                let _ = waiter.send(result);
            }
            return;
        }

        let dids: Vec<Did> = batch.iter().map(|(did, _)| did.clone()).collect();
        let _ = self.requests.fetch_add(1, Ordering::SeqCst);
        match self.fetcher.get_profiles(&dids).await {
            Ok(profiles) => {
                let by_did: HashMap<&str, &Profile> = profiles
                    .iter()
                    .map(|p| (p.did.as_str(), p))
                    .collect();
                for profile in &profiles {
                    if let Err(e) =
                        self.l1
                            .record(&profile.did, &profile.handle, CacheSource::GetProfiles)
                    {
                        warn!(error = %e, "identity cache write failed");
                    }
                    self.l2.put(&profile.did, profile.handle.clone());
                }
                for (did, waiter) in batch {
                    let result = by_did.get(did.as_str()).map_or_else(
                        || Err(IdentityError::ProfileNotFound(did.to_string())),
                        |p| Ok(p.handle.clone()),
                    );
                    let _ = waiter.send(result);
                }
            }
            Err(e) => {
                warn!(error = %e, "profile batch failed");
                for (_, waiter) in batch {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
