//! SQLite plumbing: pooling, schema, and stateless repositories.

pub mod connection;
pub mod repositories;
pub mod schema;

pub use connection::{ConnectionPool, PooledConnection, open_memory_pool, open_pool};
