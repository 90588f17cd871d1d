//! On-disk image cache keyed by slug.
//!
//! Each entry is a blob file plus a JSON sidecar carrying the content type
//! and the stored-at timestamp. Writes go through a spool file and become
//! visible only on commit (fsync + atomic rename), so a reader never
//! observes a partially-written entry as fresh. Freshness is a pure function
//! of the sidecar timestamp and the configured max age.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::stream::{StreamHandle, StreamMeta, TransferError};
use crate::tee::ChunkSink;

/// Counter distinguishing concurrent spool files within one process.
static SPOOL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Errors from reading a cache entry.
#[derive(Debug, Error)]
pub enum CacheReadError {
    /// No entry exists for the slug.
    #[error("image not cached: {0}")]
    NotCached(String),

    /// The entry exists but is unusable.
    #[error("corrupt cache entry for {slug}: {reason}")]
    Corrupt { slug: String, reason: String },

    /// I/O error opening the blob.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from writing to or purging the cache.
#[derive(Debug, Error)]
pub enum CacheWriteError {
    /// I/O error on the spool file or during commit.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Sidecar metadata could not be serialized.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Configuration for the image cache.
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    /// Directory holding blobs and sidecars.
    pub root: PathBuf,

    /// Age beyond which an entry is considered stale.
    pub max_age: Duration,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/fleetimage/images"),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Sidecar metadata stored next to each blob.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    slug: String,
    content_type: String,
    total_length: u64,
    stored_at: DateTime<Utc>,
}

/// On-disk image cache.
pub struct ImageCache {
    config: ImageCacheConfig,
}

impl ImageCache {
    /// Create a cache rooted at the configured directory.
    pub fn new(config: ImageCacheConfig) -> Self {
        Self { config }
    }

    /// Whether a committed entry exists and is within the max age.
    ///
    /// Pure query: never mutates cache state, returns `false` for
    /// never-cached slugs and for entries it cannot read.
    pub async fn is_fresh(&self, slug: &str) -> bool {
        if !self.blob_path(slug).exists() {
            return false;
        }
        let Some(meta) = self.read_meta(slug).await else {
            return false;
        };

        let age = Utc::now().signed_duration_since(meta.stored_at);
        match chrono::Duration::from_std(self.config.max_age) {
            Ok(max_age) => age <= max_age,
            Err(_) => true,
        }
    }

    /// Open a committed entry as a stream.
    pub async fn read_stream(&self, slug: &str) -> Result<StreamHandle, CacheReadError> {
        let blob_path = self.blob_path(slug);
        if !blob_path.exists() {
            return Err(CacheReadError::NotCached(slug.to_string()));
        }

        let meta = self
            .read_meta(slug)
            .await
            .ok_or_else(|| CacheReadError::Corrupt {
                slug: slug.to_string(),
                reason: "missing or unreadable sidecar".to_string(),
            })?;

        let file = File::open(&blob_path).await?;
        let total_length = file.metadata().await?.len();

        debug!(slug = %slug, bytes = total_length, "opened cache entry");

        let chunks = ReaderStream::new(file).map(|item| item.map_err(TransferError::from));
        Ok(StreamHandle::new(
            StreamMeta {
                total_length: Some(total_length),
                content_type: meta.content_type,
            },
            chunks,
        ))
    }

    /// Open a spooled writer for the slug.
    ///
    /// Nothing becomes visible to readers until [`CacheWriter::commit`]; an
    /// abandoned writer leaves any existing entry untouched.
    pub async fn write_stream(
        &self,
        slug: &str,
        meta: StreamMeta,
    ) -> Result<CacheWriter, CacheWriteError> {
        fs::create_dir_all(&self.config.root).await?;

        let final_path = self.blob_path(slug);
        let seq = SPOOL_SEQ.fetch_add(1, Ordering::Relaxed);
        let spool_path = self.config.root.join(format!(
            "{}.{}.{}.partial",
            sanitize_slug(slug),
            std::process::id(),
            seq
        ));
        let file = File::create(&spool_path).await?;

        Ok(CacheWriter {
            slug: slug.to_string(),
            content_type: meta.content_type,
            file: Some(file),
            spool_path,
            final_path,
            meta_path: self.meta_path(slug),
            bytes_written: 0,
        })
    }

    /// Purge all entries.
    ///
    /// Already-open read handles keep their file handles; reads opened after
    /// the purge fail with [`CacheReadError::NotCached`].
    pub async fn clean(&self) -> Result<(), CacheWriteError> {
        match fs::remove_dir_all(&self.config.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&self.config.root).await?;
        debug!(root = %self.config.root.display(), "cache purged");
        Ok(())
    }

    fn blob_path(&self, slug: &str) -> PathBuf {
        self.config.root.join(format!("{}.img", sanitize_slug(slug)))
    }

    fn meta_path(&self, slug: &str) -> PathBuf {
        self.config.root.join(format!("{}.json", sanitize_slug(slug)))
    }

    async fn read_meta(&self, slug: &str) -> Option<EntryMeta> {
        let contents = fs::read_to_string(self.meta_path(slug)).await.ok()?;
        match serde_json::from_str(&contents) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(slug = %slug, error = %err, "unreadable cache sidecar");
                None
            }
        }
    }
}

/// In-flight spooled write to the cache.
pub struct CacheWriter {
    slug: String,
    content_type: String,
    file: Option<File>,
    spool_path: PathBuf,
    final_path: PathBuf,
    meta_path: PathBuf,
    bytes_written: u64,
}

impl CacheWriter {
    /// Append a chunk to the spool file.
    pub async fn write_chunk(&mut self, chunk: &Bytes) -> Result<(), CacheWriteError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("writer already finished"))?;
        file.write_all(chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Make the entry durable and visible, stamping `stored_at` now.
    pub async fn commit(mut self) -> Result<(), CacheWriteError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("writer already finished"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&self.spool_path, &self.final_path).await?;

        let meta = EntryMeta {
            slug: self.slug.clone(),
            content_type: self.content_type.clone(),
            total_length: self.bytes_written,
            stored_at: Utc::now(),
        };
        fs::write(&self.meta_path, serde_json::to_string_pretty(&meta)?).await?;

        debug!(slug = %self.slug, bytes = self.bytes_written, "cache entry committed");
        Ok(())
    }

    /// Discard the spool file; any existing entry stays as it was.
    pub async fn discard(mut self) {
        self.file.take();
        if let Err(err) = fs::remove_file(&self.spool_path).await {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(slug = %self.slug, error = %err, "failed to remove spool file");
            }
        }
    }
}

#[async_trait]
impl ChunkSink for CacheWriter {
    async fn write(&mut self, chunk: &Bytes) -> io::Result<()> {
        self.write_chunk(chunk).await.map_err(io::Error::other)
    }

    async fn commit(self: Box<Self>) -> io::Result<()> {
        CacheWriter::commit(*self).await.map_err(io::Error::other)
    }

    async fn abort(self: Box<Self>) {
        self.discard().await;
    }
}

/// Sanitize a slug for use in file names.
fn sanitize_slug(slug: &str) -> String {
    slug.replace([':', '/'], "_")
}
