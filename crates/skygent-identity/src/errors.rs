//! Identity error types.

use thiserror::Error;

/// Resolution failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The network answered but had no profile for this DID.
    #[error("Profile not found for DID {0}")]
    ProfileNotFound(String),
    /// Transport failure talking to the profile endpoint.
    #[error("identity network error: {0}")]
    Network(String),
    /// The L1 cache database failed.
    #[error("identity cache error: {0}")]
    Cache(String),
}

impl From<rusqlite::Error> for IdentityError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Cache(e.to_string())
    }
}
