//! Store error types.

use std::path::PathBuf;

use thiserror::Error;

use skygent_core::ids::StoreName;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Anything that can go wrong below the engine layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite-level failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool exhaustion or setup failure.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Filesystem failure, with the path that failed.
    #[error("store io error at {path}: {source}")]
    Io {
        /// Path of the failing operation.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON encode/decode failure.
    #[error("store payload decode error{}: {source}", path.as_ref().map(|p| format!(" at {}", p.display())).unwrap_or_default())]
    Json {
        /// File the payload came from, when applicable.
        path: Option<PathBuf>,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Index invariant violation or projection failure.
    #[error("store index error: {message}")]
    Index {
        /// What went wrong.
        message: String,
    },

    /// Named store does not exist.
    #[error("store not found: {0} (see `store list`)")]
    NotFound(StoreName),

    /// Named store already exists.
    #[error("store already exists: {0}")]
    AlreadyExists(StoreName),

    /// Advisory lock could not be acquired.
    #[error("store {name} is locked: {message}")]
    Locked {
        /// The contended store.
        name: StoreName,
        /// Why acquisition failed.
        message: String,
    },

    /// Malformed primitive read back from disk.
    #[error("corrupt store data: {0}")]
    Corrupt(#[from] skygent_core::errors::IdError),
}

impl StoreError {
    /// Build an [`StoreError::Io`] from a path and io error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build an [`StoreError::Index`] from a message.
    pub fn index(message: impl Into<String>) -> Self {
        Self::Index {
            message: message.into(),
        }
    }

    /// Build a [`StoreError::Json`] tied to a file.
    pub fn json_at(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: Some(path.into()),
            source,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(source: serde_json::Error) -> Self {
        Self::Json { path: None, source }
    }
}
