//! High-level image manager orchestrating cache, fetch and staging.
//!
//! This is the public entry point of the pipeline. `get` decides
//! fresh-from-cache versus fetch-and-populate, wires the tee, and hands the
//! consumer a stream before the transfer completes.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheReadError, CacheWriteError, ImageCache};
use crate::config::Config;
use crate::source::{FetchError, FetchSource, HttpFetchSource};
use crate::staging::{self, StagingConfig, StagingError};
use crate::stream::StreamHandle;
use crate::tee::{tee, SinkOutcome};

/// Errors from the public acquisition surface.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The remote fetch failed before yielding a stream.
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// A fresh cache entry could not be read.
    #[error("cache read error: {0}")]
    CacheRead(#[from] CacheReadError),

    /// The cache could not be purged.
    #[error("cache write error: {0}")]
    CacheWrite(#[from] CacheWriteError),
}

/// Image acquisition pipeline.
pub struct ImageManager {
    cache: Arc<ImageCache>,
    source: Arc<dyn FetchSource>,
    staging: StagingConfig,
}

impl ImageManager {
    /// Build a manager from explicit components.
    pub fn new(cache: Arc<ImageCache>, source: Arc<dyn FetchSource>) -> Self {
        Self {
            cache,
            source,
            staging: StagingConfig::default(),
        }
    }

    /// Build the production pipeline from configuration.
    pub fn from_config(config: Config) -> Result<Self, AcquireError> {
        let cache = Arc::new(ImageCache::new(config.cache));
        let source = Arc::new(HttpFetchSource::new(config.source)?);
        Ok(Self {
            cache,
            source,
            staging: config.staging,
        })
    }

    /// Override the staging configuration.
    #[must_use]
    pub fn with_staging_config(mut self, staging: StagingConfig) -> Self {
        self.staging = staging;
        self
    }

    /// Get a device image as a byte stream.
    ///
    /// Served straight from the cache when the entry is fresh; otherwise the
    /// download is teed into the cache and the returned handle, which carries
    /// the upstream metadata and progress events. The handle is returned
    /// before the transfer completes; drain it to drive the download.
    ///
    /// A failure to open the cache for writing degrades to
    /// forward-without-caching rather than failing the call. Losing
    /// cacheability is non-fatal; losing the forwarded stream is.
    pub async fn get(&self, slug: &str) -> Result<StreamHandle, AcquireError> {
        if self.cache.is_fresh(slug).await {
            debug!(slug = %slug, "serving image from cache");
            return Ok(self.cache.read_stream(slug).await?);
        }

        info!(slug = %slug, "cache stale, fetching image");
        let upstream = self.source.fetch(slug).await?;
        let meta = upstream.meta().clone();

        let writer = match self.cache.write_stream(slug, meta).await {
            Ok(writer) => writer,
            Err(err) => {
                warn!(slug = %slug, error = %err, "cache unavailable, forwarding without caching");
                return Ok(upstream);
            }
        };

        let (handle, outcome) = tee(upstream, Box::new(writer));

        let slug = slug.to_string();
        tokio::spawn(async move {
            match outcome.await {
                Ok(SinkOutcome::Committed) => debug!(slug = %slug, "image cached"),
                Ok(SinkOutcome::Degraded) => {
                    warn!(slug = %slug, "cache write degraded, image forwarded uncached")
                }
                Ok(SinkOutcome::SourceFailed) => {
                    warn!(slug = %slug, "image transfer failed mid-stream")
                }
                Err(_) => {}
            }
        });

        Ok(handle)
    }

    /// Purge every cache entry, forcing the next `get` to re-fetch.
    pub async fn clean_cache(&self) -> Result<(), AcquireError> {
        info!("cleaning image cache");
        self.cache.clean().await?;
        Ok(())
    }

    /// Stage a stream at a temporary location.
    ///
    /// Archives are extracted into a fresh directory, other content is
    /// copied to a fresh file. The caller owns the returned path and is
    /// responsible for deleting it.
    pub async fn stage(&self, handle: StreamHandle) -> Result<PathBuf, StagingError> {
        staging::stage(&self.staging, handle).await
    }
}
