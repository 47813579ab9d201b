//! Raw record → [`Post`] parser.
//!
//! Sources yield feed-view-shaped JSON. The parser is deliberately
//! defensive: a malformed optional section (facet, embed, metrics) degrades
//! to "absent" rather than failing the post, while a missing required field
//! (uri, author handle, text, createdAt) is a [`ParseError`] the sync
//! engine counts against its error budget.

use std::collections::BTreeSet;

use serde_json::Value;
use thiserror::Error;

use skygent_core::ids::{Did, Handle, Hashtag, PostUri};
use skygent_core::post::{
    Embed, EmbedImage, FeedContext, FeedReason, Post, PostMetrics, ReplyRefs, StrongRef,
};

/// A raw record the parser could not turn into a post.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("post parse error: {message}")]
pub struct ParseError {
    /// What was missing or malformed.
    pub message: String,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What a raw record decodes to.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    /// A post snapshot.
    Upsert(Box<Post>),
    /// An upstream deletion (wire streams emit these).
    Delete(PostUri),
}

/// Decode one raw record.
pub fn parse_record(record: &Value) -> Result<ParsedItem, ParseError> {
    // Wire streams mark deletions with a bare `{deleted, uri}` record.
    if record.get("deleted").and_then(Value::as_bool) == Some(true) {
        let uri = required_str(record, "uri")?;
        let uri = PostUri::new(uri).map_err(|e| ParseError::new(e.to_string()))?;
        return Ok(ParsedItem::Delete(uri));
    }

    let uri = required_str(record, "uri")?;
    let uri = PostUri::new(uri).map_err(|e| ParseError::new(e.to_string()))?;

    let author_obj = record
        .get("author")
        .ok_or_else(|| ParseError::new(format!("{uri}: missing author")))?;
    let author = required_str(author_obj, "handle")
        .map_err(|_| ParseError::new(format!("{uri}: missing author.handle")))?;
    let author = Handle::new(author).map_err(|e| ParseError::new(format!("{uri}: {e}")))?;
    let author_did = author_obj
        .get("did")
        .and_then(Value::as_str)
        .and_then(|d| Did::new(d).ok());

    let inner = record
        .get("record")
        .ok_or_else(|| ParseError::new(format!("{uri}: missing record body")))?;
    let text = required_str(inner, "text")
        .map_err(|_| ParseError::new(format!("{uri}: missing record.text")))?
        .to_string();
    let created_at = required_str(inner, "createdAt")
        .map_err(|_| ParseError::new(format!("{uri}: missing record.createdAt")))?
        .parse()
        .map_err(|e| ParseError::new(format!("{uri}: bad createdAt: {e}")))?;

    let facets = inner.get("facets").cloned().filter(|f| f.is_array());
    let FacetFields {
        mut hashtags,
        mentions,
        mention_dids,
        mut links,
    } = extract_facets(facets.as_ref(), &text);

    // Inline tags the author never faceted still count as hashtags.
    for token in text.split_whitespace() {
        if let Some(tag) = token.strip_prefix('#') {
            let tag = tag.trim_end_matches(|c: char| !c.is_alphanumeric());
            if !tag.is_empty() {
                if let Ok(tag) = Hashtag::new(tag) {
                    let _ = hashtags.insert(tag);
                }
            }
        }
    }

    let reply = inner.get("reply").and_then(parse_reply);
    let embed = record
        .get("embed")
        .or_else(|| inner.get("embed"))
        .map(parse_embed);
    if let Some(Embed::External { uri: link, .. }) = &embed {
        if !links.contains(link) {
            links.push(link.clone());
        }
    }

    let metrics = parse_metrics(record);
    let langs = string_array(inner.get("langs"));
    let tags = string_array(inner.get("tags"));
    let self_labels = inner
        .get("labels")
        .and_then(|l| l.get("values"))
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.get("val").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let labels = record
        .get("labels")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.get("val").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let indexed_at = record
        .get("indexedAt")
        .and_then(Value::as_str)
        .and_then(|t| t.parse().ok());
    let feed = parse_feed_context(record);

    Ok(ParsedItem::Upsert(Box::new(Post {
        uri,
        cid: record.get("cid").and_then(Value::as_str).map(str::to_string),
        author,
        author_did,
        text,
        created_at,
        hashtags,
        mentions,
        mention_dids,
        links,
        reply,
        embed,
        metrics,
        facets,
        langs,
        tags,
        self_labels,
        labels,
        indexed_at,
        feed,
    })))
}

fn required_str<'a>(value: &'a Value, key: &str) -> Result<&'a str, ParseError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ParseError::new(format!("missing field {key:?}")))
}

#[derive(Default)]
struct FacetFields {
    hashtags: BTreeSet<Hashtag>,
    mentions: Vec<Handle>,
    mention_dids: Vec<Did>,
    links: Vec<String>,
}

/// Pull hashtags, mentions, and links out of rich-text facets.
///
/// Mention facets carry only the DID; the handle is recovered from the
/// faceted byte range of the text (`@handle`).
fn extract_facets(facets: Option<&Value>, text: &str) -> FacetFields {
    let mut out = FacetFields::default();
    let Some(facets) = facets.and_then(Value::as_array) else {
        return out;
    };
    for facet in facets {
        let features = facet
            .get("features")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for feature in features {
            match feature.get("$type").and_then(Value::as_str) {
                Some("app.bsky.richtext.facet#tag") => {
                    if let Some(tag) = feature.get("tag").and_then(Value::as_str) {
                        if let Ok(tag) = Hashtag::new(tag) {
                            let _ = out.hashtags.insert(tag);
                        }
                    }
                }
                Some("app.bsky.richtext.facet#link") => {
                    if let Some(uri) = feature.get("uri").and_then(Value::as_str) {
                        if !out.links.iter().any(|l| l == uri) {
                            out.links.push(uri.to_string());
                        }
                    }
                }
                Some("app.bsky.richtext.facet#mention") => {
                    let did = feature
                        .get("did")
                        .and_then(Value::as_str)
                        .and_then(|d| Did::new(d).ok());
                    let handle = facet
                        .get("index")
                        .and_then(|idx| {
                            let start = idx.get("byteStart")?.as_u64()? as usize;
                            let end = idx.get("byteEnd")?.as_u64()? as usize;
                            text.as_bytes().get(start..end)
                        })
                        .and_then(|bytes| std::str::from_utf8(bytes).ok())
                        .and_then(|s| Handle::new(s.trim_start_matches('@')).ok());
                    if let Some(handle) = handle {
                        out.mentions.push(handle);
                        if let Some(did) = did {
                            out.mention_dids.push(did);
                        }
                    }
                }
                _ => {}
            }
        }
    }
    out
}

fn parse_reply(reply: &Value) -> Option<ReplyRefs> {
    let strong_ref = |v: &Value| -> Option<StrongRef> {
        Some(StrongRef {
            uri: v.get("uri")?.as_str()?.to_string(),
            cid: v.get("cid").and_then(Value::as_str).map(str::to_string),
        })
    };
    Some(ReplyRefs {
        root: strong_ref(reply.get("root")?)?,
        parent: strong_ref(reply.get("parent")?)?,
    })
}

fn parse_embed(embed: &Value) -> Embed {
    let type_name = embed
        .get("$type")
        .and_then(Value::as_str)
        .map(|t| t.trim_end_matches("#view"))
        .unwrap_or_default();
    match type_name {
        "app.bsky.embed.images" => {
            let images = embed
                .get("images")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|img| EmbedImage {
                            alt: img
                                .get("alt")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            fullsize: img
                                .get("fullsize")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            thumb: img.get("thumb").and_then(Value::as_str).map(str::to_string),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Embed::Images { images }
        }
        "app.bsky.embed.external" => {
            let external = embed.get("external").unwrap_or(embed);
            Embed::External {
                uri: external
                    .get("uri")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                title: external
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                description: external
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                thumb: external
                    .get("thumb")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        }
        "app.bsky.embed.video" => Embed::Video {
            alt: embed.get("alt").and_then(Value::as_str).map(str::to_string),
            thumbnail: embed
                .get("thumbnail")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "app.bsky.embed.record" => {
            let inner = embed.get("record").unwrap_or(embed);
            Embed::Record {
                uri: inner
                    .get("uri")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                cid: inner.get("cid").and_then(Value::as_str).map(str::to_string),
            }
        }
        "app.bsky.embed.recordWithMedia" => {
            let record = embed
                .get("record")
                .map(|r| r.get("record").unwrap_or(r))
                .map(|r| StrongRef {
                    uri: r
                        .get("uri")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    cid: r.get("cid").and_then(Value::as_str).map(str::to_string),
                })
                .unwrap_or(StrongRef {
                    uri: String::new(),
                    cid: None,
                });
            let media = embed
                .get("media")
                .map_or(Embed::Unknown { raw: Value::Null }, parse_embed);
            Embed::RecordWithMedia {
                record,
                media: Box::new(media),
            }
        }
        _ => Embed::Unknown { raw: embed.clone() },
    }
}

fn parse_metrics(record: &Value) -> Option<PostMetrics> {
    let count = |key: &str| record.get(key).and_then(Value::as_u64);
    let (like, repost, reply, quote, bookmark) = (
        count("likeCount"),
        count("repostCount"),
        count("replyCount"),
        count("quoteCount"),
        count("bookmarkCount"),
    );
    if like.is_none()
        && repost.is_none()
        && reply.is_none()
        && quote.is_none()
        && bookmark.is_none()
    {
        return None;
    }
    Some(PostMetrics {
        like: like.unwrap_or(0),
        repost: repost.unwrap_or(0),
        reply: reply.unwrap_or(0),
        quote: quote.unwrap_or(0),
        bookmark: bookmark.unwrap_or(0),
    })
}

fn parse_feed_context(record: &Value) -> Option<FeedContext> {
    let reason = record.get("reason").and_then(|reason| {
        let type_name = reason.get("$type").and_then(Value::as_str)?;
        if type_name.contains("reasonRepost") {
            Some(FeedReason::ReasonRepost {
                by: reason
                    .get("by")
                    .and_then(|by| by.get("handle"))
                    .and_then(Value::as_str)
                    .and_then(|h| Handle::new(h).ok()),
                indexed_at: reason
                    .get("indexedAt")
                    .and_then(Value::as_str)
                    .and_then(|t| t.parse().ok()),
            })
        } else if type_name.contains("reasonPin") {
            Some(FeedReason::ReasonPin)
        } else {
            None
        }
    });
    let reply = record.get("feedReply").cloned();
    if reason.is_none() && reply.is_none() {
        return None;
    }
    Some(FeedContext { reason, reply })
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(rkey: &str, text: &str) -> Value {
        json!({
            "uri": format!("at://did:plc:abc/app.bsky.feed.post/{rkey}"),
            "cid": "bafyrei",
            "author": {"did": "did:plc:abc", "handle": "alice.bsky.social"},
            "record": {"text": text, "createdAt": "2026-01-01T00:00:00Z"},
        })
    }

    fn unwrap_post(item: ParsedItem) -> Post {
        match item {
            ParsedItem::Upsert(post) => *post,
            ParsedItem::Delete(uri) => panic!("unexpected delete of {uri}"),
        }
    }

    #[test]
    fn minimal_record_parses() {
        let post = unwrap_post(parse_record(&raw("1", "hello world")).unwrap());
        assert_eq!(post.text, "hello world");
        assert_eq!(post.author.as_str(), "alice.bsky.social");
        assert_eq!(post.author_did.as_ref().unwrap().as_str(), "did:plc:abc");
        assert!(post.is_original());
    }

    #[test]
    fn missing_required_fields_fail() {
        assert!(parse_record(&json!({"cid": "x"})).is_err());
        let mut record = raw("1", "hi");
        record["record"]
            .as_object_mut()
            .unwrap()
            .remove("createdAt");
        assert!(parse_record(&record).is_err());
        let mut record = raw("1", "hi");
        record.as_object_mut().unwrap().remove("author");
        assert!(parse_record(&record).is_err());
    }

    #[test]
    fn delete_records_parse() {
        let item = parse_record(&json!({
            "deleted": true,
            "uri": "at://did:plc:abc/app.bsky.feed.post/gone",
        }))
        .unwrap();
        assert_matches::assert_matches!(item, ParsedItem::Delete(uri) if uri.rkey() == "gone");
    }

    #[test]
    fn facets_extract_tags_mentions_links() {
        let text = "ping @bob.test check https://example.com #Rust";
        let mut record = raw("1", text);
        let mention_start = text.find("@bob.test").unwrap();
        record["record"]["facets"] = json!([
            {
                "index": {"byteStart": mention_start, "byteEnd": mention_start + "@bob.test".len()},
                "features": [{"$type": "app.bsky.richtext.facet#mention", "did": "did:plc:bob"}]
            },
            {
                "index": {"byteStart": 0, "byteEnd": 0},
                "features": [{"$type": "app.bsky.richtext.facet#link", "uri": "https://example.com"}]
            },
            {
                "index": {"byteStart": 0, "byteEnd": 0},
                "features": [{"$type": "app.bsky.richtext.facet#tag", "tag": "Rust"}]
            }
        ]);

        let post = unwrap_post(parse_record(&record).unwrap());
        assert!(post.hashtags.contains(&Hashtag::new("#rust").unwrap()));
        assert_eq!(post.mentions, vec![Handle::new("bob.test").unwrap()]);
        assert_eq!(post.mention_dids, vec![Did::new("did:plc:bob").unwrap()]);
        assert_eq!(post.links, vec!["https://example.com".to_string()]);
    }

    #[test]
    fn inline_hashtags_without_facets_count() {
        let post = unwrap_post(parse_record(&raw("1", "shipping #Rust today, and #tokio.")).unwrap());
        assert!(post.hashtags.contains(&Hashtag::new("#rust").unwrap()));
        assert!(post.hashtags.contains(&Hashtag::new("#tokio").unwrap()));
    }

    #[test]
    fn image_embed_parses() {
        let mut record = raw("1", "pics");
        record["embed"] = json!({
            "$type": "app.bsky.embed.images#view",
            "images": [{"alt": "a bird", "fullsize": "https://cdn/full.jpg", "thumb": "https://cdn/t.jpg"}]
        });
        let post = unwrap_post(parse_record(&record).unwrap());
        assert!(post.has_images());
        assert_eq!(post.embed.unwrap().alt_texts(), vec!["a bird"]);
    }

    #[test]
    fn external_embed_contributes_link() {
        let mut record = raw("1", "read this");
        record["embed"] = json!({
            "$type": "app.bsky.embed.external#view",
            "external": {"uri": "https://blog.example.com/post", "title": "A post"}
        });
        let post = unwrap_post(parse_record(&record).unwrap());
        assert_eq!(post.links, vec!["https://blog.example.com/post".to_string()]);
        assert!(!post.has_images());
    }

    #[test]
    fn quote_embeds_classify_as_quotes() {
        let mut record = raw("1", "look at this");
        record["embed"] = json!({
            "$type": "app.bsky.embed.record#view",
            "record": {"uri": "at://did:plc:x/app.bsky.feed.post/q", "cid": "bafy"}
        });
        let post = unwrap_post(parse_record(&record).unwrap());
        assert!(post.is_quote());

        let mut record = raw("2", "quote with pic");
        record["embed"] = json!({
            "$type": "app.bsky.embed.recordWithMedia#view",
            "record": {"record": {"uri": "at://did:plc:x/app.bsky.feed.post/q"}},
            "media": {"$type": "app.bsky.embed.images#view", "images": [{"alt": ""}]}
        });
        let post = unwrap_post(parse_record(&record).unwrap());
        assert!(post.is_quote());
        assert!(post.has_images());
    }

    #[test]
    fn unknown_embed_is_preserved() {
        let mut record = raw("1", "odd");
        record["embed"] = json!({"$type": "app.bsky.embed.future", "data": 42});
        let post = unwrap_post(parse_record(&record).unwrap());
        assert_matches::assert_matches!(post.embed, Some(Embed::Unknown { .. }));
    }

    #[test]
    fn metrics_and_reply_and_reason() {
        let mut record = raw("1", "busy post");
        record["likeCount"] = json!(12);
        record["replyCount"] = json!(3);
        record["record"]["reply"] = json!({
            "root": {"uri": "at://did:plc:x/app.bsky.feed.post/root", "cid": "c0"},
            "parent": {"uri": "at://did:plc:x/app.bsky.feed.post/parent"}
        });
        record["reason"] = json!({
            "$type": "app.bsky.feed.defs#reasonRepost",
            "by": {"handle": "carol.test"},
            "indexedAt": "2026-01-02T00:00:00Z"
        });

        let post = unwrap_post(parse_record(&record).unwrap());
        let metrics = post.metrics.unwrap();
        assert_eq!(metrics.like, 12);
        assert_eq!(metrics.reply, 3);
        assert_eq!(metrics.repost, 0);
        assert!(post.is_reply());
        assert!(post.is_repost());
        assert_eq!(
            post.reply.as_ref().unwrap().root.uri,
            "at://did:plc:x/app.bsky.feed.post/root"
        );
    }

    #[test]
    fn langs_and_labels() {
        let mut record = raw("1", "hola");
        record["record"]["langs"] = json!(["es", "en"]);
        record["record"]["labels"] = json!({"values": [{"val": "spoiler"}]});
        record["labels"] = json!([{"val": "nudity"}]);

        let post = unwrap_post(parse_record(&record).unwrap());
        assert_eq!(post.langs, vec!["es".to_string(), "en".to_string()]);
        assert_eq!(post.self_labels, vec!["spoiler".to_string()]);
        assert_eq!(post.labels, vec!["nudity".to_string()]);
    }
}
