//! Remote image origin.
//!
//! [`FetchSource`] abstracts "give me the bytes for this slug"; the pipeline
//! only ever sees a [`StreamHandle`]. [`HttpFetchSource`] is the production
//! implementation over the image endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::stream::{Progress, StreamHandle, StreamMeta, TransferError};

/// Errors raised before a fetch yields any bytes.
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The origin does not know the slug.
    #[error("image not found: {0}")]
    NotFound(String),

    /// The origin answered with an unexpected status.
    #[error("unexpected status {status} for {slug}")]
    Status { slug: String, status: StatusCode },
}

/// A remote origin that resolves a slug to a byte stream.
#[async_trait]
pub trait FetchSource: Send + Sync {
    /// Start downloading the image for `slug`.
    ///
    /// Fails with [`FetchError`] before any byte is produced; mid-transfer
    /// failures surface as [`TransferError`] items on the returned stream.
    async fn fetch(&self, slug: &str) -> Result<StreamHandle, FetchError>;
}

/// Configuration for the HTTP fetch source.
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Base URL of the image endpoint.
    pub base_url: String,

    /// TCP connect timeout. No overall deadline: downloads may legitimately
    /// run for a long time.
    pub connect_timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://images.fleetimage.dev".to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Fetch source backed by the HTTP image endpoint.
pub struct HttpFetchSource {
    config: HttpSourceConfig,
    client: Client,
}

impl HttpFetchSource {
    /// Create a source for the configured endpoint.
    pub fn new(config: HttpSourceConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn download_url(&self, slug: &str) -> String {
        format!(
            "{}/images/{}/download",
            self.config.base_url.trim_end_matches('/'),
            slug
        )
    }
}

#[async_trait]
impl FetchSource for HttpFetchSource {
    async fn fetch(&self, slug: &str) -> Result<StreamHandle, FetchError> {
        let url = self.download_url(slug);
        debug!(slug = %slug, url = %url, "starting image download");

        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound(slug.to_string())),
            status => {
                return Err(FetchError::Status {
                    slug: slug.to_string(),
                    status,
                })
            }
        }

        let total_length = response.content_length();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        debug!(
            slug = %slug,
            total_length = ?total_length,
            content_type = %content_type,
            "download stream open"
        );

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let mut received = 0u64;
        let chunks = response.bytes_stream().map(move |item| match item {
            Ok(chunk) => {
                received += chunk.len() as u64;
                let _ = progress_tx.send(Progress::new(received, total_length));
                Ok(chunk)
            }
            Err(err) => Err(TransferError::Upstream(err.to_string())),
        });

        Ok(StreamHandle::new(
            StreamMeta {
                total_length,
                content_type,
            },
            chunks,
        )
        .with_progress(progress_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_url_joins_base_and_slug() {
        let source = HttpFetchSource::new(HttpSourceConfig {
            base_url: "https://images.example.com/".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            source.download_url("raspberry-pi"),
            "https://images.example.com/images/raspberry-pi/download"
        );
    }
}
