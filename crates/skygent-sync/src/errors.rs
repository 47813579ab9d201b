//! Engine error types, classified by pipeline stage.

use thiserror::Error;

use skygent_core::ids::StoreName;
use skygent_filter::{FilterCompileError, FilterEvalError};
use skygent_store::StoreError;

/// Failure in a network data source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Transport-level failure (connect, timeout).
    #[error("source network error: {0}")]
    Network(String),
    /// HTTP error status.
    #[error("source http error ({status}): {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Response detail.
        message: String,
    },
    /// The source answered with something undecodable.
    #[error("source decode error: {0}")]
    Decode(String),
    /// Authentication / authorization failure.
    #[error("source auth error: {0}")]
    Auth(String),
}

/// Which stage of the sync pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Fetching or decoding from the data source.
    Source,
    /// Filter compilation or evaluation.
    Filter,
    /// Store IO or indexing.
    Store,
}

/// Fatal sync failure. Per-post parse and eval problems accumulate in
/// `SyncResult.errors` instead and never raise this.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The data source failed.
    #[error("sync source failure: {0}")]
    Source(#[from] SourceError),
    /// The filter does not compile.
    #[error("sync filter failure: {0}")]
    FilterCompile(#[from] FilterCompileError),
    /// An effectful filter exhausted its retries.
    #[error("sync filter failure: {0}")]
    FilterEval(#[from] FilterEvalError),
    /// The store rejected a write or read.
    #[error("sync store failure: {0}")]
    Store(#[from] StoreError),
    /// Error budget exhausted (strict mode or `max_errors`).
    #[error("sync aborted: {0}")]
    Aborted(String),
}

impl SyncError {
    /// Classify this failure by pipeline stage.
    pub fn stage(&self) -> SyncStage {
        match self {
            Self::Source(_) | Self::Aborted(_) => SyncStage::Source,
            Self::FilterCompile(_) | Self::FilterEval(_) => SyncStage::Filter,
            Self::Store(_) => SyncStage::Store,
        }
    }
}

/// Fatal derivation failure.
#[derive(Debug, Error)]
pub enum DerivationError {
    /// `source == target`.
    #[error("derivation source and target must be different stores")]
    SameStore,
    /// `EventTime` mode with an effectful filter.
    #[error("EventTime derivation requires a pure filter (effectful predicates depend on derive time)")]
    EffectfulFilter,
    /// Checkpoint pins a different filter or mode, or the target already
    /// has events with no checkpoint.
    #[error("derivation settings changed for {target}, use --reset to rebuild the target")]
    SettingsChanged {
        /// The target store.
        target: StoreName,
    },
    /// The filter does not compile.
    #[error("derivation filter failure: {0}")]
    Compile(#[from] FilterCompileError),
    /// An effectful filter exhausted its retries.
    #[error("derivation filter failure: {0}")]
    Eval(#[from] FilterEvalError),
    /// Store IO or indexing failure.
    #[error("derivation store failure: {0}")]
    Store(#[from] StoreError),
}
