//! # skygent-identity
//!
//! DID↔handle resolution fronting the network with two cache tiers:
//!
//! - **L1** ([`cache::IdentityCacheDb`]) — a persistent SQLite K-V at
//!   `<storeRoot>/identity.db` mapping both directions, with a `verified`
//!   bit separating authoritative records from opportunistic ones
//! - **L2** ([`cache::RequestCache`]) — an in-memory LRU (capacity 5000,
//!   TTL 6 h by default) holding only `did → handle`
//!
//! Misses funnel into a batching resolver: concurrent asks queue up and
//! are dispatched together, at most 25 DIDs per outbound request.

#![deny(unsafe_code)]

pub mod cache;
pub mod errors;
pub mod resolver;

pub use cache::{CacheSource, IdentityCacheDb, RequestCache};
pub use errors::IdentityError;
pub use resolver::{Profile, ProfileFetcher, ProfileResolver, ResolverConfig};
