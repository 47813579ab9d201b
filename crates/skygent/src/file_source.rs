//! File-backed data source: replay an NDJSON capture of raw posts.
//!
//! The network transport is an external collaborator; this source lets the
//! CLI ingest captures (one raw record per line, or a single JSON array)
//! through the exact same sync pipeline. Records are paged in chunks of 50
//! with the record offset as page cursor, so checkpoint resume works the
//! same way it does against a live endpoint.

use std::path::{Path, PathBuf};

use futures::stream::BoxStream;
use serde_json::Value;

use skygent_sync::{DataSource, RawPost, SourceDescriptor, SourceError};

const PAGE_SIZE: usize = 50;

/// Replayable capture file.
pub struct FileSource {
    path: PathBuf,
    records: Vec<Value>,
}

impl FileSource {
    /// Load a capture: a JSON array, or NDJSON (one record per line).
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let trimmed = raw.trim_start();
        let records = if trimmed.starts_with('[') {
            serde_json::from_str::<Vec<Value>>(&raw)?
        } else {
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(serde_json::from_str)
                .collect::<Result<Vec<Value>, _>>()?
        };
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }
}

impl DataSource for FileSource {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::Feed {
            uri: format!("file://{}", self.path.display()),
        }
    }

    fn stream(&self, cursor: Option<String>) -> BoxStream<'static, Result<RawPost, SourceError>> {
        let start: usize = cursor
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0)
            .min(self.records.len());
        let total = self.records.len();
        let items: Vec<RawPost> = self.records[start..]
            .iter()
            .enumerate()
            .map(|(i, record)| {
                let offset = start + i + 1;
                let closes_page = offset % PAGE_SIZE == 0 || offset == total;
                RawPost {
                    record: record.clone(),
                    page_cursor: closes_page.then(|| offset.to_string()),
                }
            })
            .collect();
        Box::pin(futures::stream::iter(items.into_iter().map(Ok)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
