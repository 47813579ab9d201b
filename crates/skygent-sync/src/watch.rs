//! Watch loops: a timer-driven repeated sync.
//!
//! `watch` yields one [`SyncEvent`] per cycle as a lazy stream. The loop is
//! externally controlled: a `max_cycles` bound, a cancellation token, or
//! simply dropping the stream all end it. Recoverable source errors are
//! yielded as items and the loop continues; anything else (or any error
//! under `strict`) terminates the stream after being yielded.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skygent_filter::{FilterExpr, FilterRuntime};
use skygent_store::store::Store;

use crate::errors::{SyncError, SyncStage};
use crate::source::DataSource;
use crate::sync::{SyncOptions, SyncResult, sync};

/// Watch loop configuration.
#[derive(Clone)]
pub struct WatchConfig {
    /// Pause between cycles.
    pub interval: Duration,
    /// Stop after this many cycles (`None` = run until cancelled).
    pub max_cycles: Option<u64>,
    /// Per-cycle sync options. The embedded cancellation token also stops
    /// the watch loop itself.
    pub sync: SyncOptions,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_cycles: None,
            sync: SyncOptions::default(),
        }
    }
}

/// One watch cycle's outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEvent {
    /// Zero-based cycle counter.
    pub cycle: u64,
    /// The cycle's sync result.
    pub result: SyncResult,
}

/// Repeatedly sync on a timer, yielding one event per cycle.
pub fn watch(
    source: Arc<dyn DataSource>,
    store: Arc<Store>,
    filter: FilterExpr,
    runtime: FilterRuntime,
    config: WatchConfig,
) -> impl Stream<Item = Result<SyncEvent, SyncError>> {
    let cancel: CancellationToken = config.sync.cancel.clone();
    async_stream::stream! {
        let mut cycle: u64 = 0;
        loop {
            if let Some(max) = config.max_cycles {
                if cycle >= max {
                    debug!(cycle, "watch reached max cycles");
                    break;
                }
            }
            if cancel.is_cancelled() {
                debug!(cycle, "watch cancelled");
                break;
            }

            match sync(source.as_ref(), &store, &filter, &runtime, &config.sync).await {
                Ok(result) => {
                    yield Ok(SyncEvent { cycle, result });
                }
                Err(e) => {
                    let recoverable =
                        e.stage() == SyncStage::Source && !config.sync.strict;
                    warn!(error = %e, recoverable, "watch cycle failed");
                    yield Err(e);
                    if !recoverable {
                        break;
                    }
                }
            }
            cycle += 1;

            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(cycle, "watch cancelled during sleep");
                    break;
                }
                () = tokio::time::sleep(config.interval) => {}
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
