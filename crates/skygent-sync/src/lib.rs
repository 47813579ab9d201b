//! # skygent-sync
//!
//! The engines that move posts into and between stores.
//!
//! - [`source`] — the `DataSource` capability: a lazy stream of raw post
//!   records with page-cursor sentinels, plus the descriptor keys that
//!   identify a source in checkpoints
//! - [`parser`] — raw record → [`skygent_core::post::Post`] (facet
//!   extraction, embeds, metrics, reply refs)
//! - [`sync`] — paginated ingestion with resumable checkpoints,
//!   dedupe/refresh policies, and bounded error accumulation
//! - [`watch`] — a timer-driven repeated sync emitting one result per cycle
//! - [`derive`] — deterministic replay of a source store's event log
//!   through a filter into a target store, with checkpoints and lineage

#![deny(unsafe_code)]

pub mod derive;
pub mod errors;
pub mod parser;
pub mod source;
pub mod sync;
pub mod watch;

pub use derive::{DeriveOptions, DeriveResult, derive};
pub use errors::{DerivationError, SourceError, SyncError, SyncStage};
pub use source::{DataSource, RawPost, SourceDescriptor, VecSource};
pub use sync::{SyncOptions, SyncResult, sync};
pub use watch::{SyncEvent, WatchConfig, watch};
