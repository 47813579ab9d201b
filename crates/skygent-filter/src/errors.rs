//! Filter error types.

use thiserror::Error;

/// Structural validation failure. The expression never ran.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("filter compile error: {message}")]
pub struct FilterCompileError {
    /// What is wrong with the expression.
    pub message: String,
}

impl FilterCompileError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Evaluation failure.
///
/// Raised only when a `Retry` error policy exhausts its attempts (or on an
/// internal evaluator invariant violation); `Include`/`Exclude` policies
/// absorb provider failures.
#[derive(Debug, Error)]
#[error("filter eval error: {message}")]
pub struct FilterEvalError {
    /// What failed.
    pub message: String,
    /// Underlying provider failure, if any.
    #[source]
    pub cause: Option<ProviderError>,
}

impl FilterEvalError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub(crate) fn with_cause(message: impl Into<String>, cause: ProviderError) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause),
        }
    }
}

/// Failure inside an effectful capability provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Network-level failure (connect, timeout, HTTP status).
    #[error("provider network error: {0}")]
    Network(String),
    /// The capability is not wired into this runtime.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// The provider answered with something unusable.
    #[error("provider returned malformed data: {0}")]
    Malformed(String),
}
