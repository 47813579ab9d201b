//! Image cache error types.

use std::path::PathBuf;

use thiserror::Error;

/// Anything the image cache can fail with.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The cache is disabled by configuration.
    #[error("image cache is disabled")]
    Disabled,

    /// Filesystem failure.
    #[error("image cache io error at {path}: {source}")]
    Io {
        /// Failing path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Transport failure.
    #[error("image fetch failed for {url}: {message}")]
    Fetch {
        /// The URL.
        url: String,
        /// What went wrong.
        message: String,
    },

    /// The server did not answer with an image.
    #[error("{url} is not an image (content-type {content_type:?})")]
    NotAnImage {
        /// The URL.
        url: String,
        /// What the server claimed.
        content_type: String,
    },

    /// The asset exceeds the configured byte cap.
    #[error("{url} exceeds the image size cap ({size} > {max} bytes)")]
    TooLarge {
        /// The URL.
        url: String,
        /// Observed size.
        size: u64,
        /// Configured cap.
        max: u64,
    },

    /// A recent failed fetch is still in the negative cache.
    #[error("{url} recently failed to fetch; retry after the failure TTL")]
    NegativeCached {
        /// The URL.
        url: String,
    },

    /// The store's event log could not be scanned for references.
    #[error("image reference scan failed: {0}")]
    Scan(String),

    /// Metadata decode failure.
    #[error("image meta decode error at {path}: {source}")]
    Meta {
        /// Failing path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl ImageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
