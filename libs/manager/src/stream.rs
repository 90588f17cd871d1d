//! Byte stream handles with attached transfer metadata.
//!
//! A [`StreamHandle`] is the unit of exchange across the pipeline: a chunked
//! byte stream annotated with the total length (when the producer knows it),
//! the content type, and an optional channel of [`Progress`] events. A handle
//! is exclusively consumed once; duplication happens only through the tee.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced mid-flight on a byte stream.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The upstream producer failed after the transfer started.
    #[error("upstream read failed: {0}")]
    Upstream(String),

    /// I/O error while reading or writing a local blob.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A single progress observation for an in-flight transfer.
///
/// `bytes_received` is monotonically non-decreasing across the events of one
/// transfer. `percentage` is `None` when the total size is unknown, never a
/// value computed against a zero or missing total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes received so far.
    pub bytes_received: u64,

    /// Total bytes expected, if advertised by the producer.
    pub total_bytes: Option<u64>,

    /// Completion percentage, indeterminate when the total is unknown.
    pub percentage: Option<u8>,
}

impl Progress {
    /// Build a progress event from a byte count and an optional total.
    pub fn new(bytes_received: u64, total_bytes: Option<u64>) -> Self {
        let percentage = total_bytes
            .filter(|total| *total > 0)
            .map(|total| ((bytes_received * 100) / total).min(100) as u8);

        Self {
            bytes_received,
            total_bytes,
            percentage,
        }
    }
}

/// Receiver half of a handle's progress channel.
pub type ProgressReceiver = mpsc::UnboundedReceiver<Progress>;

/// Metadata attached to a stream at construction.
#[derive(Debug, Clone)]
pub struct StreamMeta {
    /// Total length in bytes, `None` when the origin did not advertise one.
    pub total_length: Option<u64>,

    /// MIME type of the content.
    pub content_type: String,
}

/// Boxed chunk stream carried by a [`StreamHandle`].
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// A live byte stream plus its transfer metadata.
///
/// Implements [`Stream`] over `Result<Bytes, TransferError>`; drain it with
/// `StreamExt::next`. Producers attach progress with [`with_progress`];
/// consumers detach the receiver with [`take_progress`] before or while
/// draining.
///
/// [`with_progress`]: StreamHandle::with_progress
/// [`take_progress`]: StreamHandle::take_progress
pub struct StreamHandle {
    meta: StreamMeta,
    chunks: ByteStream,
    progress: Option<ProgressReceiver>,
}

impl StreamHandle {
    /// Wrap a chunk stream with its metadata.
    pub fn new<S>(meta: StreamMeta, chunks: S) -> Self
    where
        S: Stream<Item = Result<Bytes, TransferError>> + Send + 'static,
    {
        Self {
            meta,
            chunks: Box::pin(chunks),
            progress: None,
        }
    }

    /// Attach a progress channel to this handle.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressReceiver) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Stream metadata.
    pub fn meta(&self) -> &StreamMeta {
        &self.meta
    }

    /// Total length in bytes, if known.
    pub fn total_length(&self) -> Option<u64> {
        self.meta.total_length
    }

    /// MIME type of the content.
    pub fn content_type(&self) -> &str {
        &self.meta.content_type
    }

    /// Detach the progress receiver, if the producer attached one.
    ///
    /// Handles served from cache carry no progress channel.
    pub fn take_progress(&mut self) -> Option<ProgressReceiver> {
        self.progress.take()
    }

    /// Split the handle into metadata, chunk stream and progress receiver.
    pub(crate) fn into_parts(self) -> (StreamMeta, ByteStream, Option<ProgressReceiver>) {
        (self.meta, self.chunks, self.progress)
    }
}

impl Stream for StreamHandle {
    type Item = Result<Bytes, TransferError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().chunks.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("meta", &self.meta)
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}
