//! The image cache proper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use skygent_core::Timestamp;

use crate::errors::ImageError;

/// Which tier of the cache an asset lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    /// Full-size bytes under `originals/`.
    Original,
    /// Thumbnails under `thumb/`.
    Thumb,
}

impl ImageKind {
    fn dir(self) -> &'static str {
        match self {
            Self::Original => "originals",
            Self::Thumb => "thumb",
        }
    }
}

/// Per-asset metadata, one JSON per content key.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum MetaRecord {
    /// A successful fetch.
    Cached {
        /// Source URL.
        url: String,
        /// Variant file name.
        variant: String,
        /// Server content type.
        content_type: String,
        /// Byte count.
        bytes: u64,
        /// When the bytes landed.
        fetched_at: Timestamp,
        /// Parsed mime (same value as `content_type`, normalized).
        mime: String,
    },
    /// A failed fetch (negative cache entry).
    Failed {
        /// Source URL.
        url: String,
        /// Why it failed.
        error: String,
        /// When it failed.
        failed_at: Timestamp,
    },
}

/// Cache configuration.
#[derive(Clone, Debug)]
pub struct ImageCacheConfig {
    /// Cache root (`<storeRoot>/images`).
    pub root: PathBuf,
    /// Whether the cache is active.
    pub enabled: bool,
    /// Positive entry TTL.
    pub cache_ttl: Duration,
    /// Negative entry TTL.
    pub failure_ttl: Duration,
    /// Fetch size cap in bytes.
    pub max_bytes: u64,
    /// Concurrent fetches across all URLs.
    pub fetch_concurrency: usize,
}

impl ImageCacheConfig {
    /// Defaults rooted at a directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            enabled: true,
            cache_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            failure_ttl: Duration::from_secs(10 * 60),
            max_bytes: 10 * 1024 * 1024,
            fetch_concurrency: 4,
        }
    }
}

/// Content-addressed image cache with request coalescing.
pub struct ImageCache {
    config: ImageCacheConfig,
    client: reqwest::Client,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    fetch_permits: Semaphore,
}

/// sha256(url), lowercase hex — the content key.
pub fn content_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ImageCache {
    /// Cache over a config; the HTTP client is shared across fetches.
    pub fn new(config: ImageCacheConfig) -> Self {
        let fetch_permits = Semaphore::new(config.fetch_concurrency.max(1));
        Self {
            config,
            client: reqwest::Client::new(),
            inflight: DashMap::new(),
            fetch_permits,
        }
    }

    /// The cache root.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Path of an asset file for a key.
    pub fn asset_path(&self, kind: ImageKind, key: &str, variant: &str) -> PathBuf {
        self.config.root.join(kind.dir()).join(key).join(variant)
    }

    /// Path of the meta file for a key.
    pub fn meta_path(&self, key: &str) -> PathBuf {
        self.config.root.join("meta").join(format!("{key}.json"))
    }

    /// Read the meta record for a key, `None` when absent.
    pub fn read_meta(&self, key: &str) -> Result<Option<MetaRecord>, ImageError> {
        let path = self.meta_path(key);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ImageError::io(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| ImageError::Meta { path, source: e })
    }

    /// Fetch-or-serve an original image. Returns the on-disk path.
    pub async fn get(&self, url: &str, variant: &str) -> Result<PathBuf, ImageError> {
        self.get_kind(ImageKind::Original, url, variant).await
    }

    /// Fetch-or-serve a thumbnail.
    pub async fn get_thumb(&self, url: &str, variant: &str) -> Result<PathBuf, ImageError> {
        self.get_kind(ImageKind::Thumb, url, variant).await
    }

    async fn get_kind(
        &self,
        kind: ImageKind,
        url: &str,
        variant: &str,
    ) -> Result<PathBuf, ImageError> {
        if !self.config.enabled {
            return Err(ImageError::Disabled);
        }
        let key = content_key(url);

        // Single-flight: concurrent gets for one URL serialize here; the
        // losers find the winner's bytes in the freshness check inside.
        let gate = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = gate.lock().await;
            self.serve_or_fetch(kind, url, variant, &key).await
        };
        drop(gate);
        // The gate only matters while a get is in flight. Once the last
        // waiter is done (the map's own Arc is the sole holder), drop the
        // entry; `remove_if` runs under the shard lock, so it cannot race
        // a concurrent `entry(...).clone()` for the same key.
        let _ = self
            .inflight
            .remove_if(&key, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    async fn serve_or_fetch(
        &self,
        kind: ImageKind,
        url: &str,
        variant: &str,
        key: &str,
    ) -> Result<PathBuf, ImageError> {
        let path = self.asset_path(kind, key, variant);
        match self.read_meta(key)? {
            Some(MetaRecord::Cached { fetched_at, .. })
                if path.exists() && !expired(fetched_at, self.config.cache_ttl) =>
            {
                return Ok(path);
            }
            Some(MetaRecord::Failed { failed_at, .. })
                if !expired(failed_at, self.config.failure_ttl) =>
            {
                return Err(ImageError::NegativeCached {
                    url: url.to_string(),
                });
            }
            _ => {}
        }

        match self.fetch(url).await {
            Ok((content_type, body)) => {
                write_atomic(&path, &body)?;
                let meta = MetaRecord::Cached {
                    url: url.to_string(),
                    variant: variant.to_string(),
                    content_type: content_type.clone(),
                    bytes: body.len() as u64,
                    fetched_at: chrono::Utc::now(),
                    mime: content_type,
                };
                self.write_meta(key, &meta)?;
                debug!(url, bytes = body.len(), "image cached");
                Ok(path)
            }
            Err(e) => {
                warn!(url, error = %e, "image fetch failed, recording negative entry");
                let meta = MetaRecord::Failed {
                    url: url.to_string(),
                    error: e.to_string(),
                    failed_at: chrono::Utc::now(),
                };
                self.write_meta(key, &meta)?;
                Err(e)
            }
        }
    }

    /// HEAD (best effort) then GET, with a content-type gate and a hard
    /// byte cap enforced while streaming.
    async fn fetch(&self, url: &str) -> Result<(String, Vec<u8>), ImageError> {
        let _permit = self.fetch_permits.acquire().await.map_err(|_| {
            ImageError::Fetch {
                url: url.to_string(),
                message: "fetch pool closed".into(),
            }
        })?;
        let max = self.config.max_bytes;

        // HEAD lets oversized or non-image assets bail before the body;
        // servers that reject HEAD fall through to GET.
        if let Ok(head) = self.client.head(url).send().await {
            if head.status().is_success() {
                if let Some(content_type) = header_str(&head, reqwest::header::CONTENT_TYPE) {
                    if !content_type.starts_with("image/") {
                        return Err(ImageError::NotAnImage {
                            url: url.to_string(),
                            content_type,
                        });
                    }
                }
                if let Some(length) = head.content_length() {
                    if length > max {
                        return Err(ImageError::TooLarge {
                            url: url.to_string(),
                            size: length,
                            max,
                        });
                    }
                }
            }
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ImageError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ImageError::Fetch {
                url: url.to_string(),
                message: format!("http status {}", response.status()),
            });
        }
        let content_type =
            header_str(&response, reqwest::header::CONTENT_TYPE).unwrap_or_default();
        if !content_type.starts_with("image/") {
            return Err(ImageError::NotAnImage {
                url: url.to_string(),
                content_type,
            });
        }

        let mut body: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ImageError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            if (body.len() + chunk.len()) as u64 > max {
                return Err(ImageError::TooLarge {
                    url: url.to_string(),
                    size: (body.len() + chunk.len()) as u64,
                    max,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok((content_type, body))
    }

    fn write_meta(&self, key: &str, meta: &MetaRecord) -> Result<(), ImageError> {
        let path = self.meta_path(key);
        let body = serde_json::to_vec_pretty(meta).map_err(|e| ImageError::Meta {
            path: path.clone(),
            source: e,
        })?;
        write_atomic(&path, &body)
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase())
}

fn expired(at: Timestamp, ttl: Duration) -> bool {
    let age = chrono::Utc::now().signed_duration_since(at);
    age >= chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

/// Temp file in the destination directory, then rename.
fn write_atomic(path: &Path, body: &[u8]) -> Result<(), ImageError> {
    let parent = path
        .parent()
        .ok_or_else(|| ImageError::io(path, std::io::Error::other("no parent directory")))?;
    std::fs::create_dir_all(parent).map_err(|e| ImageError::io(parent, e))?;
    let tmp = path.with_extension("part");
    std::fs::write(&tmp, body).map_err(|e| ImageError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| ImageError::io(path, e))?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG: &[u8] = b"\x89PNG fake image bytes";

    fn cache_at(root: &Path) -> ImageCache {
        ImageCache::new(ImageCacheConfig::new(root))
    }

    async fn serve_image(server: &MockServer, route: &str, expect: u64) {
        Mock::given(method("GET"))
            .and(url_path(route.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(PNG),
            )
            .expect(expect)
            .mount(server)
            .await;
        Mock::given(method("HEAD"))
            .and(url_path(route.to_string()))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "image/png"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn fetch_writes_bytes_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        serve_image(&server, "/img.png", 1).await;

        let cache = cache_at(dir.path());
        let url = format!("{}/img.png", server.uri());
        let path = cache.get(&url, "fullsize").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), PNG);
        let key = content_key(&url);
        assert!(path.ends_with(format!("originals/{key}/fullsize")));
        let meta = cache.read_meta(&key).unwrap().unwrap();
        assert_matches::assert_matches!(
            meta,
            MetaRecord::Cached { bytes, ref content_type, .. }
                if bytes == PNG.len() as u64 && content_type == "image/png"
        );
    }

    #[tokio::test]
    async fn second_get_serves_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        // expect(1): a second network hit would fail the mock.
        serve_image(&server, "/img.png", 1).await;

        let cache = cache_at(dir.path());
        let url = format!("{}/img.png", server.uri());
        let first = cache.get(&url, "fullsize").await.unwrap();
        let second = cache.get(&url, "fullsize").await.unwrap();
        assert_eq!(first, second);
        // The single-flight gate is transient; nothing lingers per URL.
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn concurrent_gets_coalesce_into_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        serve_image(&server, "/img.png", 1).await;

        let cache = Arc::new(cache_at(dir.path()));
        let url = format!("{}/img.png", server.uri());
        let tasks = (0..8).map(|_| {
            let cache = cache.clone();
            let url = url.clone();
            tokio::spawn(async move { cache.get(&url, "fullsize").await })
        });
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        // The last finisher removes the gate once no waiter holds it.
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn non_image_content_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html>not an image</html>"),
            )
            .mount(&server)
            .await;

        let cache = cache_at(dir.path());
        let url = format!("{}/page", server.uri());
        let err = cache.get(&url, "fullsize").await.unwrap_err();
        assert_matches::assert_matches!(err, ImageError::NotAnImage { .. });
    }

    #[tokio::test]
    async fn oversized_bodies_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![0u8; 4096]),
            )
            .mount(&server)
            .await;

        let mut config = ImageCacheConfig::new(dir.path());
        config.max_bytes = 1024;
        let cache = ImageCache::new(config);
        let url = format!("{}/huge.png", server.uri());
        let err = cache.get(&url, "fullsize").await.unwrap_err();
        assert_matches::assert_matches!(err, ImageError::TooLarge { .. });
    }

    #[tokio::test]
    async fn failures_are_negative_cached() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        // expect(1): the second get must NOT reach the network.
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let cache = cache_at(dir.path());
        let url = format!("{}/dead.png", server.uri());
        let first = cache.get(&url, "fullsize").await.unwrap_err();
        assert_matches::assert_matches!(first, ImageError::Fetch { .. });
        let second = cache.get(&url, "fullsize").await.unwrap_err();
        assert_matches::assert_matches!(second, ImageError::NegativeCached { .. });
    }

    #[tokio::test]
    async fn disabled_cache_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ImageCacheConfig::new(dir.path());
        config.enabled = false;
        let cache = ImageCache::new(config);
        let err = cache.get("https://example.com/x.png", "fullsize").await.unwrap_err();
        assert_matches::assert_matches!(err, ImageError::Disabled);
    }

    #[test]
    fn content_key_is_stable_sha256() {
        assert_eq!(content_key("a"), content_key("a"));
        assert_ne!(content_key("a"), content_key("b"));
        assert_eq!(content_key("x").len(), 64);
    }
}
