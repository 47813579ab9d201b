//! Post index repository — projects events into relational shape.
//!
//! The index is derived state. `apply` folds one event; a rebuild is
//! `clear` followed by replaying the log. The `indexed_through` meta row
//! records the last applied event id so readers can cheaply tell whether
//! the projection is in sync with the log.

use rusqlite::{Connection, OptionalExtension, params};

use skygent_core::event::{Event, EventRecord};
use skygent_core::ids::{Did, EventId, Handle, Hashtag, PostUri};
use skygent_core::post::{Embed, Post, PostMetrics, ReplyRefs, StrongRef};

use crate::errors::{Result, StoreError};
use crate::sqlite::schema::META_INDEXED_THROUGH;
use crate::types::{IndexFilter, Order, SearchPage, SearchQuery, SearchSort, StoreQuery, ThreadGroup};

/// Default page size for index scans.
pub const SCAN_PAGE_SIZE: usize = 200;

/// Post index repository — stateless, every method takes `&Connection`.
pub struct PostIndexRepo;

impl PostIndexRepo {
    // ─────────────────────────────────────────────────────────────────────
    // Projection
    // ─────────────────────────────────────────────────────────────────────

    /// Fold one event into the index and advance `indexed_through`.
    /// Caller supplies the transaction scope.
    pub fn apply(conn: &Connection, record: &EventRecord) -> Result<()> {
        match &record.event {
            Event::PostUpsert { post, .. } => Self::apply_upsert(conn, post)?,
            Event::PostDelete { uri, .. } => Self::apply_delete(conn, uri)?,
        }
        Self::mark_indexed_through(conn, Some(&record.id))
    }

    fn apply_upsert(conn: &Connection, post: &Post) -> Result<()> {
        let uri = post.uri.as_str();
        let metrics_json = post
            .metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let embed_json = post.embed.as_ref().map(serde_json::to_string).transpose()?;
        let langs_json = if post.langs.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&post.langs)?)
        };
        let labels_json = if post.labels.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&post.labels)?)
        };

        let _ = conn.execute(
            "INSERT OR IGNORE INTO posts
                 (uri, cid, author, author_did, text, created_at, created_date, indexed_at,
                  reply_root, reply_parent, has_images, has_video, has_link,
                  metrics_json, embed_json, langs_json, labels_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                uri,
                post.cid,
                post.author.as_str(),
                post.author_did.as_ref().map(Did::as_str),
                post.text,
                post.created_at.to_rfc3339(),
                post.created_date(),
                post.indexed_at.map(|t| t.to_rfc3339()),
                post.reply.as_ref().map(|r| r.root.uri.as_str()),
                post.reply.as_ref().map(|r| r.parent.uri.as_str()),
                i64::from(post.has_images()),
                i64::from(post.has_video()),
                i64::from(post.has_links()),
                metrics_json,
                embed_json,
                langs_json,
                labels_json,
            ],
        )?;

        // Join rows are replaced wholesale so a re-applied event converges.
        let _ = conn.execute("DELETE FROM post_hashtag WHERE uri = ?1", params![uri])?;
        let _ = conn.execute("DELETE FROM post_mention WHERE uri = ?1", params![uri])?;
        let _ = conn.execute("DELETE FROM post_link WHERE uri = ?1", params![uri])?;
        let _ = conn.execute("DELETE FROM post_lang WHERE uri = ?1", params![uri])?;

        for tag in &post.hashtags {
            let _ = conn.execute(
                "INSERT OR IGNORE INTO post_hashtag (uri, tag) VALUES (?1, ?2)",
                params![uri, tag.as_str()],
            )?;
        }
        for (i, handle) in post.mentions.iter().enumerate() {
            let did = post.mention_dids.get(i).map(Did::as_str);
            let _ = conn.execute(
                "INSERT OR IGNORE INTO post_mention (uri, handle, did) VALUES (?1, ?2, ?3)",
                params![uri, handle.as_str(), did],
            )?;
        }
        for url in &post.links {
            let _ = conn.execute(
                "INSERT OR IGNORE INTO post_link (uri, url) VALUES (?1, ?2)",
                params![uri, url],
            )?;
        }
        for lang in &post.langs {
            let _ = conn.execute(
                "INSERT OR IGNORE INTO post_lang (uri, lang) VALUES (?1, ?2)",
                params![uri, lang],
            )?;
        }
        Ok(())
    }

    fn apply_delete(conn: &Connection, uri: &PostUri) -> Result<()> {
        let _ = conn.execute("DELETE FROM posts WHERE uri = ?1", params![uri.as_str()])?;
        Ok(())
    }

    /// Drop every index row. Caller supplies the transaction scope.
    pub fn clear(conn: &Connection) -> Result<()> {
        let _ = conn.execute("DELETE FROM posts", [])?;
        let _ = conn.execute(
            "DELETE FROM event_log_meta WHERE key = ?1",
            params![META_INDEXED_THROUGH],
        )?;
        Ok(())
    }

    /// Record the last event id the index has applied.
    pub fn mark_indexed_through(conn: &Connection, id: Option<&EventId>) -> Result<()> {
        match id {
            Some(id) => {
                let _ = conn.execute(
                    "INSERT INTO event_log_meta (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![META_INDEXED_THROUGH, id.to_string()],
                )?;
            }
            None => {
                let _ = conn.execute(
                    "DELETE FROM event_log_meta WHERE key = ?1",
                    params![META_INDEXED_THROUGH],
                )?;
            }
        }
        Ok(())
    }

    /// The last event id the index has applied, if any.
    pub fn indexed_through(conn: &Connection) -> Result<Option<EventId>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM event_log_meta WHERE key = ?1",
                params![META_INDEXED_THROUGH],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| EventId::parse(&r).map_err(StoreError::Corrupt))
            .transpose()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Point queries
    // ─────────────────────────────────────────────────────────────────────

    /// Whether a live row exists for this URI.
    pub fn has_uri(conn: &Connection, uri: &PostUri) -> Result<bool> {
        let found: Option<String> = conn
            .query_row(
                "SELECT uri FROM posts WHERE uri = ?1",
                params![uri.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Count live posts.
    pub fn count(conn: &Connection) -> Result<u64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Fetch a single post by URI.
    pub fn get_post(conn: &Connection, uri: &PostUri) -> Result<Option<Post>> {
        let row = conn
            .query_row(
                &format!("{POST_SELECT} WHERE uri = ?1"),
                params![uri.as_str()],
                Self::map_row,
            )
            .optional()?;
        row.map(|r| Self::hydrate(conn, r)).transpose()
    }

    /// URIs of posts created on a calendar date (`YYYY-MM-DD`), ascending.
    pub fn get_by_date(conn: &Connection, date: &str) -> Result<Vec<PostUri>> {
        let mut stmt = conn.prepare(
            "SELECT uri FROM posts WHERE created_date = ?1 ORDER BY created_at ASC, uri ASC",
        )?;
        let uris: Vec<String> = stmt
            .query_map(params![date], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        uris.into_iter()
            .map(|u| PostUri::new(u).map_err(StoreError::Corrupt))
            .collect()
    }

    /// URIs of posts carrying a hashtag, ascending by creation time.
    pub fn get_by_hashtag(conn: &Connection, tag: &Hashtag) -> Result<Vec<PostUri>> {
        let mut stmt = conn.prepare(
            "SELECT p.uri FROM posts p
             JOIN post_hashtag h ON h.uri = p.uri
             WHERE h.tag = ?1
             ORDER BY p.created_at ASC, p.uri ASC",
        )?;
        let uris: Vec<String> = stmt
            .query_map(params![tag.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        uris.into_iter()
            .map(|u| PostUri::new(u).map_err(StoreError::Corrupt))
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scans
    // ─────────────────────────────────────────────────────────────────────

    /// One page of an index scan. Returns the posts plus the cursor for the
    /// next page (`None` once exhausted).
    pub fn query_page(
        conn: &Connection,
        query: &StoreQuery,
        page_size: usize,
    ) -> Result<(Vec<Post>, Option<String>)> {
        use std::fmt::Write;

        let mut sql = format!("{POST_SELECT} WHERE 1=1");
        let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(filter) = &query.filter {
            push_index_filter(&mut sql, &mut params_vec, filter);
        }
        if let Some(author) = &query.author {
            let _ = write!(sql, " AND author = ?{}", params_vec.len() + 1);
            params_vec.push(Box::new(author.as_str().to_string()));
        }
        if let Some(tag) = &query.hashtag {
            let _ = write!(
                sql,
                " AND EXISTS (SELECT 1 FROM post_hashtag h WHERE h.uri = posts.uri AND h.tag = ?{})",
                params_vec.len() + 1
            );
            params_vec.push(Box::new(tag.as_str().to_string()));
        }
        if let Some((start, end)) = &query.date_range {
            let _ = write!(
                sql,
                " AND created_at >= ?{} AND created_at < ?{}",
                params_vec.len() + 1,
                params_vec.len() + 2
            );
            params_vec.push(Box::new(start.to_rfc3339()));
            params_vec.push(Box::new(end.to_rfc3339()));
        }

        if let Some(cursor) = &query.cursor {
            let (created_at, uri) = decode_cursor(cursor)?;
            let op = match query.order {
                Order::Asc => ">",
                Order::Desc => "<",
            };
            let _ = write!(
                sql,
                " AND (created_at {op} ?{n} OR (created_at = ?{n} AND uri {op} ?{m}))",
                n = params_vec.len() + 1,
                m = params_vec.len() + 2,
            );
            params_vec.push(Box::new(created_at));
            params_vec.push(Box::new(uri));
        }

        let dir = match query.order {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        };
        let _ = write!(
            sql,
            " ORDER BY created_at {dir}, uri {dir} LIMIT {page_size}"
        );

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            params_vec.iter().map(Box::as_ref).collect();
        let rows: Vec<PostRow> = stmt
            .query_map(params_refs.as_slice(), Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let next_cursor = if rows.len() == page_size {
            rows.last().map(|r| encode_cursor(&r.created_at, &r.uri))
        } else {
            None
        };
        let posts = rows
            .into_iter()
            .map(|r| Self::hydrate(conn, r))
            .collect::<Result<Vec<_>>>()?;
        Ok((posts, next_cursor))
    }

    /// LIKE-based substring search with an OFFSET cursor.
    pub fn search(conn: &Connection, query: &SearchQuery) -> Result<SearchPage> {
        let limit = query.limit.unwrap_or(50).max(1);
        let offset: u64 = query
            .cursor
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|_| StoreError::index("malformed search cursor"))?
            .unwrap_or(0);
        let dir = match query.sort {
            SearchSort::Newest => "DESC",
            SearchSort::Oldest => "ASC",
        };
        let pattern = format!("%{}%", escape_like(&query.query));
        let sql = format!(
            "{POST_SELECT} WHERE text LIKE ?1 ESCAPE '\\'
             ORDER BY created_at {dir}, uri {dir} LIMIT {limit} OFFSET {offset}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<PostRow> = stmt
            .query_map(params![pattern], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let next_cursor = if rows.len() as u64 == limit {
            Some((offset + limit).to_string())
        } else {
            None
        };
        let posts = rows
            .into_iter()
            .map(|r| Self::hydrate(conn, r))
            .collect::<Result<Vec<_>>>()?;
        Ok(SearchPage { posts, next_cursor })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Threads
    // ─────────────────────────────────────────────────────────────────────

    /// Reply groups by `reply_root`, largest first.
    pub fn thread_groups(conn: &Connection) -> Result<Vec<ThreadGroup>> {
        let mut stmt = conn.prepare(
            "SELECT reply_root, COUNT(*) FROM posts
             WHERE reply_root IS NOT NULL
             GROUP BY reply_root
             ORDER BY COUNT(*) DESC, reply_root ASC",
        )?;
        let groups = stmt
            .query_map([], |row| {
                Ok(ThreadGroup {
                    root: row.get(0)?,
                    posts: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// Posts of one thread: the root itself plus every indexed reply under
    /// it, ascending by creation time.
    pub fn thread_posts(conn: &Connection, root: &str) -> Result<Vec<Post>> {
        let sql = format!(
            "{POST_SELECT} WHERE uri = ?1 OR reply_root = ?1 ORDER BY created_at ASC, uri ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<PostRow> = stmt
            .query_map(params![root], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(|r| Self::hydrate(conn, r)).collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Row mapping
    // ─────────────────────────────────────────────────────────────────────

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PostRow> {
        Ok(PostRow {
            uri: row.get(0)?,
            cid: row.get(1)?,
            author: row.get(2)?,
            author_did: row.get(3)?,
            text: row.get(4)?,
            created_at: row.get(5)?,
            indexed_at: row.get(6)?,
            reply_root: row.get(7)?,
            reply_parent: row.get(8)?,
            metrics_json: row.get(9)?,
            embed_json: row.get(10)?,
            langs_json: row.get(11)?,
            labels_json: row.get(12)?,
        })
    }

    /// Reconstruct a `Post` from an index row plus its join tables.
    ///
    /// The index is a projection: facets, feed context, and reply CIDs are
    /// not carried, so a hydrated post is the queryable subset of the
    /// original snapshot.
    fn hydrate(conn: &Connection, row: PostRow) -> Result<Post> {
        let uri = PostUri::new(&row.uri).map_err(StoreError::Corrupt)?;

        let mut stmt = conn.prepare("SELECT tag FROM post_hashtag WHERE uri = ?1")?;
        let hashtags = stmt
            .query_map(params![row.uri], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|t| Hashtag::new(t).map_err(StoreError::Corrupt))
            .collect::<Result<_>>()?;

        let mut stmt =
            conn.prepare("SELECT handle, did FROM post_mention WHERE uri = ?1 ORDER BY handle")?;
        let mention_rows: Vec<(String, Option<String>)> = stmt
            .query_map(params![row.uri], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut mentions = Vec::with_capacity(mention_rows.len());
        let mut mention_dids = Vec::new();
        for (handle, did) in mention_rows {
            mentions.push(Handle::new(handle).map_err(StoreError::Corrupt)?);
            if let Some(did) = did {
                mention_dids.push(Did::new(did).map_err(StoreError::Corrupt)?);
            }
        }

        let mut stmt = conn.prepare("SELECT url FROM post_link WHERE uri = ?1 ORDER BY url")?;
        let links: Vec<String> = stmt
            .query_map(params![row.uri], |r| r.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let reply = match (row.reply_root, row.reply_parent) {
            (Some(root), Some(parent)) => Some(ReplyRefs {
                root: StrongRef {
                    uri: root,
                    cid: None,
                },
                parent: StrongRef {
                    uri: parent,
                    cid: None,
                },
            }),
            _ => None,
        };

        let metrics: Option<PostMetrics> = row
            .metrics_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let embed: Option<Embed> = row
            .embed_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let langs: Vec<String> = row
            .langs_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();
        let labels: Vec<String> = row
            .labels_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();

        Ok(Post {
            uri,
            cid: row.cid,
            author: Handle::new(row.author).map_err(StoreError::Corrupt)?,
            author_did: row
                .author_did
                .map(|d| Did::new(d).map_err(StoreError::Corrupt))
                .transpose()?,
            text: row.text,
            created_at: row
                .created_at
                .parse()
                .map_err(|e| StoreError::index(format!("bad created_at: {e}")))?,
            hashtags,
            mentions,
            mention_dids,
            links,
            reply,
            embed,
            metrics,
            facets: None,
            langs,
            tags: Vec::new(),
            self_labels: Vec::new(),
            labels,
            indexed_at: row
                .indexed_at
                .map(|t| {
                    t.parse()
                        .map_err(|e| StoreError::index(format!("bad indexed_at: {e}")))
                })
                .transpose()?,
            feed: None,
        })
    }
}

const POST_SELECT: &str = "SELECT uri, cid, author, author_did, text, created_at, indexed_at,
       reply_root, reply_parent, metrics_json, embed_json, langs_json, labels_json
  FROM posts";

struct PostRow {
    uri: String,
    cid: Option<String>,
    author: String,
    author_did: Option<String>,
    text: String,
    created_at: String,
    indexed_at: Option<String>,
    reply_root: Option<String>,
    reply_parent: Option<String>,
    metrics_json: Option<String>,
    embed_json: Option<String>,
    langs_json: Option<String>,
    labels_json: Option<String>,
}

fn push_index_filter(
    sql: &mut String,
    params_vec: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
    filter: &IndexFilter,
) {
    use std::fmt::Write;
    match filter {
        IndexFilter::HasImages => sql.push_str(" AND has_images = 1"),
        IndexFilter::HasVideo => sql.push_str(" AND has_video = 1"),
        IndexFilter::HasLinks => sql.push_str(" AND has_link = 1"),
        IndexFilter::Author { handle } => {
            let _ = write!(sql, " AND author = ?{}", params_vec.len() + 1);
            params_vec.push(Box::new(handle.as_str().to_string()));
        }
        IndexFilter::Hashtag { tag } => {
            let _ = write!(
                sql,
                " AND EXISTS (SELECT 1 FROM post_hashtag h WHERE h.uri = posts.uri AND h.tag = ?{})",
                params_vec.len() + 1
            );
            params_vec.push(Box::new(tag.as_str().to_string()));
        }
        IndexFilter::DateRange { start, end } => {
            let _ = write!(
                sql,
                " AND created_at >= ?{} AND created_at < ?{}",
                params_vec.len() + 1,
                params_vec.len() + 2
            );
            params_vec.push(Box::new(start.to_rfc3339()));
            params_vec.push(Box::new(end.to_rfc3339()));
        }
    }
}

fn encode_cursor(created_at: &str, uri: &str) -> String {
    format!("{created_at}|{uri}")
}

fn decode_cursor(cursor: &str) -> Result<(String, String)> {
    cursor
        .split_once('|')
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .ok_or_else(|| StoreError::index("malformed scan cursor"))
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
