//! Staging: materialize a stream at a temporary location.
//!
//! Archives are extracted into a fresh directory, everything else is copied
//! into a fresh file. The returned path is owned by the caller; this module
//! never deletes it, including after a failure (the partial path is left in
//! place for inspection).

use std::io;
use std::path::PathBuf;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::task;
use tracing::debug;

use crate::extract::{extract_archive, ArchiveFormat, ExtractError};
use crate::stream::{StreamHandle, TransferError};

/// Errors from staging a stream.
#[derive(Debug, Error)]
pub enum StagingError {
    /// I/O error allocating or writing the staging path.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The source stream failed mid-transfer.
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// The stream declared an archive format but did not contain one.
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),

    /// The blocking extraction task was cancelled or panicked.
    #[error("extraction task failed: {0}")]
    Task(#[from] task::JoinError),
}

/// Configuration for the stager.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    /// Parent directory for staging paths.
    pub parent: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            parent: std::env::temp_dir(),
        }
    }
}

/// Stage `handle` under the configured parent directory.
///
/// Allocates a collision-free path per call: a directory when the content
/// type denotes an archive, a plain file otherwise. Resolves with the path
/// only after the stream is fully consumed and the destination is populated.
pub async fn stage(config: &StagingConfig, handle: StreamHandle) -> Result<PathBuf, StagingError> {
    fs::create_dir_all(&config.parent).await?;

    match ArchiveFormat::from_content_type(handle.content_type()) {
        Some(format) => stage_archive(config, handle, format).await,
        None => stage_file(config, handle).await,
    }
}

/// Spool the stream to a temporary file, then extract it into a fresh
/// directory on a blocking thread.
async fn stage_archive(
    config: &StagingConfig,
    mut handle: StreamHandle,
    format: ArchiveFormat,
) -> Result<PathBuf, StagingError> {
    let dest = tempfile::Builder::new()
        .prefix("fleetimage-")
        .tempdir_in(&config.parent)?
        .keep();

    // Archive readers need random access, so the stream is spooled to disk
    // first. The spool is removed when it drops; the destination stays.
    let spool = tempfile::Builder::new()
        .prefix("fleetimage-")
        .suffix(".spool")
        .tempfile_in(&config.parent)?;
    let spool_path = spool.path().to_path_buf();

    let mut file = File::create(&spool_path).await?;
    while let Some(chunk) = handle.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    drop(file);

    let extract_dest = dest.clone();
    task::spawn_blocking(move || extract_archive(format, &spool_path, &extract_dest)).await??;
    drop(spool);

    debug!(path = %dest.display(), format = ?format, "archive staged");
    Ok(dest)
}

/// Copy the stream verbatim into a fresh file.
async fn stage_file(
    config: &StagingConfig,
    mut handle: StreamHandle,
) -> Result<PathBuf, StagingError> {
    let staged = tempfile::Builder::new()
        .prefix("fleetimage-")
        .suffix(".img")
        .tempfile_in(&config.parent)?;
    let (file, path) = staged.keep().map_err(|err| StagingError::Io(err.error))?;

    let mut file = File::from_std(file);
    while let Some(chunk) = handle.next().await {
        match chunk {
            Ok(chunk) => file.write_all(&chunk).await?,
            Err(err) => {
                // Flush what arrived; the partial file stays for inspection.
                let _ = file.flush().await;
                return Err(err.into());
            }
        }
    }
    file.flush().await?;
    drop(file);

    debug!(path = %path.display(), "stream staged to file");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::stream;
    use tempfile::TempDir;

    use crate::stream::StreamMeta;

    use super::*;

    fn handle(content_type: &str, chunks: Vec<Result<Bytes, TransferError>>) -> StreamHandle {
        StreamHandle::new(
            StreamMeta {
                total_length: None,
                content_type: content_type.to_string(),
            },
            stream::iter(chunks),
        )
    }

    #[tokio::test]
    async fn plain_stream_becomes_file() {
        let dir = TempDir::new().unwrap();
        let config = StagingConfig {
            parent: dir.path().to_path_buf(),
        };

        let source = handle(
            "application/octet-stream",
            vec![Ok(Bytes::from_static(b"XY")), Ok(Bytes::from_static(b"Z"))],
        );
        let path = stage(&config, source).await.unwrap();

        assert!(path.is_file());
        assert_eq!(fs::read(&path).await.unwrap(), b"XYZ");
    }

    #[tokio::test]
    async fn staging_paths_are_unique() {
        let dir = TempDir::new().unwrap();
        let config = StagingConfig {
            parent: dir.path().to_path_buf(),
        };

        let a = stage(
            &config,
            handle("text/plain", vec![Ok(Bytes::from_static(b"a"))]),
        )
        .await
        .unwrap();
        let b = stage(
            &config,
            handle("text/plain", vec![Ok(Bytes::from_static(b"b"))]),
        )
        .await
        .unwrap();

        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn transfer_failure_surfaces_and_leaves_partial_file() {
        let dir = TempDir::new().unwrap();
        let config = StagingConfig {
            parent: dir.path().to_path_buf(),
        };

        let source = handle(
            "application/octet-stream",
            vec![
                Ok(Bytes::from_static(b"partial")),
                Err(TransferError::Upstream("connection reset".to_string())),
            ],
        );
        let err = stage(&config, source).await.unwrap_err();
        assert!(matches!(err, StagingError::Transfer(_)));

        // The partially-written file stays behind for inspection.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .collect();
        assert_eq!(leftovers.len(), 1);
        assert_eq!(
            std::fs::read(leftovers[0].path()).unwrap(),
            b"partial"
        );
    }
}
