//! Store database schema.
//!
//! `event_log` is the source of truth; `posts` and its join tables are a
//! projection that can be rebuilt from the log at any time. Join tables
//! cascade on post deletion so a single `DELETE FROM posts` removes the
//! whole footprint of a URI.

use rusqlite::Connection;

use crate::errors::Result;

/// Meta key holding the highest appended event id.
pub const META_LAST_EVENT_ID: &str = "last_event_id";
/// Meta key holding the event id the index has applied through.
pub const META_INDEXED_THROUGH: &str = "indexed_through";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS event_log (
    event_id     TEXT PRIMARY KEY,
    event_type   TEXT NOT NULL,
    post_uri     TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    source       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event_log_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_checkpoint (
    source        TEXT PRIMARY KEY,
    cursor        TEXT,
    filter_hash   TEXT NOT NULL,
    last_event_id TEXT,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS posts (
    uri          TEXT PRIMARY KEY,
    cid          TEXT,
    author       TEXT NOT NULL,
    author_did   TEXT,
    text         TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    created_date TEXT NOT NULL,
    indexed_at   TEXT,
    reply_root   TEXT,
    reply_parent TEXT,
    has_images   INTEGER NOT NULL DEFAULT 0,
    has_video    INTEGER NOT NULL DEFAULT 0,
    has_link     INTEGER NOT NULL DEFAULT 0,
    metrics_json TEXT,
    embed_json   TEXT,
    langs_json   TEXT,
    labels_json  TEXT
);

CREATE TABLE IF NOT EXISTS post_hashtag (
    uri TEXT NOT NULL REFERENCES posts(uri) ON DELETE CASCADE,
    tag TEXT NOT NULL,
    PRIMARY KEY (uri, tag)
);

CREATE TABLE IF NOT EXISTS post_mention (
    uri    TEXT NOT NULL REFERENCES posts(uri) ON DELETE CASCADE,
    handle TEXT NOT NULL,
    did    TEXT,
    PRIMARY KEY (uri, handle)
);

CREATE TABLE IF NOT EXISTS post_link (
    uri TEXT NOT NULL REFERENCES posts(uri) ON DELETE CASCADE,
    url TEXT NOT NULL,
    PRIMARY KEY (uri, url)
);

CREATE TABLE IF NOT EXISTS post_lang (
    uri  TEXT NOT NULL REFERENCES posts(uri) ON DELETE CASCADE,
    lang TEXT NOT NULL,
    PRIMARY KEY (uri, lang)
);

CREATE INDEX IF NOT EXISTS idx_posts_created_at   ON posts(created_at);
CREATE INDEX IF NOT EXISTS idx_posts_created_date ON posts(created_date);
CREATE INDEX IF NOT EXISTS idx_posts_author       ON posts(author);
CREATE INDEX IF NOT EXISTS idx_posts_author_did   ON posts(author_did);
CREATE INDEX IF NOT EXISTS idx_posts_reply_root   ON posts(reply_root);
CREATE INDEX IF NOT EXISTS idx_hashtag_tag        ON post_hashtag(tag);
CREATE INDEX IF NOT EXISTS idx_mention_handle     ON post_mention(handle);
CREATE INDEX IF NOT EXISTS idx_mention_did        ON post_mention(did);
CREATE INDEX IF NOT EXISTS idx_link_url           ON post_link(url);
";

/// Apply the schema. Safe to call on every open.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
