//! Configuration for the image pipeline.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::cache::ImageCacheConfig;
use crate::source::HttpSourceConfig;
use crate::staging::StagingConfig;

/// Pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// On-disk cache settings.
    pub cache: ImageCacheConfig,

    /// Image endpoint settings.
    pub source: HttpSourceConfig,

    /// Staging directory settings.
    pub staging: StagingConfig,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut cache = ImageCacheConfig::default();
        if let Some(dir) = std::env::var("FLEETIMG_CACHE_DIR").ok().filter(|s| !s.is_empty()) {
            cache.root = PathBuf::from(dir);
        }
        if let Some(secs) = std::env::var("FLEETIMG_CACHE_MAX_AGE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            cache.max_age = Duration::from_secs(secs);
        }

        let mut source = HttpSourceConfig::default();
        if let Some(url) = std::env::var("FLEETIMG_IMAGE_ENDPOINT").ok().filter(|s| !s.is_empty()) {
            source.base_url = url;
        }
        if let Some(secs) = std::env::var("FLEETIMG_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            source.connect_timeout = Duration::from_secs(secs);
        }

        let mut staging = StagingConfig::default();
        if let Some(dir) = std::env::var("FLEETIMG_STAGING_DIR").ok().filter(|s| !s.is_empty()) {
            staging.parent = PathBuf::from(dir);
        }

        Ok(Self {
            cache,
            source,
            staging,
        })
    }
}
