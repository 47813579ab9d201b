//! # skygent-core
//!
//! Foundation types for the skygent firehose engine.
//!
//! This crate provides the shared vocabulary that all other skygent crates
//! depend on:
//!
//! - **Branded primitives**: [`ids::Handle`], [`ids::Did`], [`ids::Hashtag`],
//!   [`ids::PostUri`], [`ids::StoreName`], [`ids::EventId`] as validating newtypes
//! - **Posts**: [`post::Post`] — an immutable snapshot of a social-network post,
//!   with the [`post::Embed`] tagged union and feed context
//! - **Events**: [`event::Event`] (`PostUpsert` / `PostDelete`) and the
//!   [`event::EventRecord`] wire envelope
//! - **Event ids**: [`ids::EventIdGenerator`] — monotonic ULID generation
//! - **Errors**: [`errors::IdError`] shared across crate boundaries
//! - **Retry**: [`retry::RetryConfig`] and backoff calculation
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other skygent crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod event;
pub mod ids;
pub mod post;
pub mod retry;

/// UTC instant, RFC 3339 on the wire.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
