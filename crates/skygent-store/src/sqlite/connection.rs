//! Connection pooling for per-store databases.
//!
//! Every connection is initialized with the same pragmas: WAL journaling,
//! foreign keys on, `synchronous = NORMAL`, and a 5 s busy timeout. The
//! schema is applied idempotently when the pool opens, so callers can
//! checkout connections without a bootstrap dance.

use std::path::Path;
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::Result;
use crate::sqlite::schema;

/// Pool of SQLite connections to one store database.
pub type ConnectionPool = r2d2::Pool<SqliteConnectionManager>;

/// One checked-out connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 8;

fn configure(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )
}

/// Open (or create) a store database and apply the schema.
pub fn open_pool(db_path: &Path) -> Result<ConnectionPool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| crate::errors::StoreError::io(parent, e))?;
    }
    let manager = SqliteConnectionManager::file(db_path).with_init(configure);
    let pool = r2d2::Pool::builder()
        .max_size(MAX_CONNECTIONS)
        .build(manager)?;
    let conn = pool.get()?;
    schema::init(&conn)?;
    Ok(pool)
}

/// In-memory pool for tests. A single connection keeps the database alive
/// and visible across all checkouts.
pub fn open_memory_pool() -> Result<ConnectionPool> {
    let manager = SqliteConnectionManager::memory().with_init(configure);
    let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::init(&conn)?;
    Ok(pool)
}
