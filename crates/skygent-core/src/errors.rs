//! Shared error vocabulary.
//!
//! Component-specific errors live in their own crates (store, filter,
//! sync, …). This module holds only what crosses every boundary: primitive
//! validation failures and the process exit-code mapping.

use thiserror::Error;

/// Malformed primitive value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Not a valid handle.
    #[error("invalid handle: {0:?}")]
    InvalidHandle(String),
    /// Not a valid DID.
    #[error("invalid DID: {0:?}")]
    InvalidDid(String),
    /// Not a valid hashtag.
    #[error("invalid hashtag: {0:?}")]
    InvalidHashtag(String),
    /// Not a valid post AT-URI.
    #[error("invalid post URI: {0:?}")]
    InvalidPostUri(String),
    /// Not a valid store name.
    #[error("invalid store name: {0:?} (allowed: [A-Za-z0-9._-], no leading dot, max 64 chars)")]
    InvalidStoreName(String),
    /// Not a valid 26-char ULID.
    #[error("invalid event id: {0:?}")]
    InvalidEventId(String),
}

/// Process exit codes, shared between the CLI and error mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Success.
    Ok = 0,
    /// Generic failure.
    Generic = 1,
    /// Malformed input or configuration.
    Input = 2,
    /// Named store does not exist.
    StoreNotFound = 3,
    /// Network / source failure.
    Source = 5,
    /// Store IO or index failure.
    StoreIo = 7,
    /// Filter compile or eval failure.
    Filter = 8,
}

impl ExitCode {
    /// Numeric code handed to the OS.
    pub fn code(self) -> i32 {
        self as i32
    }
}
