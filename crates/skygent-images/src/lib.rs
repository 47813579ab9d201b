//! # skygent-images
//!
//! Content-addressed on-disk cache for post images.
//!
//! Layout under `<storeRoot>/images`:
//!
//! ```text
//! originals/<sha256(url)>/<variant>   raw bytes
//! thumb/<sha256(url)>/<variant>       thumbnails
//! meta/<sha256(url)>.json             per-asset metadata or failure marker
//! ```
//!
//! [`cache::ImageCache::get`] serves from disk while the entry is fresh,
//! fetches otherwise (HEAD→GET, content-type gate, size cap, atomic
//! write), and records failures as negative entries so a dead URL is not
//! hammered. Concurrent gets for one URL coalesce into a single fetch.
//!
//! [`sweep`] holds the two collectors: TTL expiry and store-driven orphan
//! removal.

#![deny(unsafe_code)]

pub mod cache;
pub mod errors;
pub mod sweep;

pub use cache::{ImageCache, ImageCacheConfig, ImageKind, MetaRecord};
pub use errors::ImageError;
pub use sweep::{OrphanReport, SweepReport, orphan_sweep, ttl_sweep};
