//! Stream tee: duplicate one inbound byte stream into a durable sink and a
//! consumer handle.
//!
//! The tee reads the source one chunk at a time and, per chunk, writes the
//! sink first and only then offers the chunk to the consumer over a bounded
//! channel. Chunk N+1 is not read upstream until chunk N has been accepted by
//! both sides, so a slow sink or a stalled consumer slows the upstream read
//! instead of growing a buffer.
//!
//! Sink failures degrade: the sink is aborted and forwarding continues.
//! Source failures are fatal to both sides. The consumer observes
//! end-of-stream only after the sink commit has been acknowledged durable.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::stream::{ByteStream, StreamHandle, TransferError};

/// Upper bound on chunks buffered between the tee and the consumer.
const CONSUMER_CHANNEL_DEPTH: usize = 1;

/// A destination for the durable branch of a tee.
///
/// Writes are acknowledged per chunk; `commit` must not return before the
/// destination is durable. An aborted sink must leave no partial state
/// visible.
#[async_trait]
pub trait ChunkSink: Send {
    /// Append one chunk to the destination.
    async fn write(&mut self, chunk: &Bytes) -> std::io::Result<()>;

    /// Finalize the destination, making it durable and visible.
    async fn commit(self: Box<Self>) -> std::io::Result<()>;

    /// Discard the destination, leaving prior state untouched.
    async fn abort(self: Box<Self>);
}

/// Terminal outcome of a tee's sink branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Every chunk reached the sink and the commit was acknowledged.
    Committed,

    /// The sink failed mid-stream and was abandoned; the consumer branch
    /// stayed healthy.
    Degraded,

    /// The source failed; the sink was aborted and the consumer received the
    /// error.
    SourceFailed,
}

/// Duplicate `source` into `sink` and a returned consumer handle.
///
/// Metadata is copied onto the returned handle once, at construction, and the
/// source's progress channel moves over verbatim. The transfer itself runs on
/// a spawned task; the handle is returned before any byte has flowed. The
/// sink branch's outcome is reported on the returned channel after the
/// consumer's end-of-stream is decided.
pub fn tee(source: StreamHandle, sink: Box<dyn ChunkSink>) -> (StreamHandle, oneshot::Receiver<SinkOutcome>) {
    let (meta, chunks, progress) = source.into_parts();
    let (chunk_tx, chunk_rx) = mpsc::channel(CONSUMER_CHANNEL_DEPTH);
    let (outcome_tx, outcome_rx) = oneshot::channel();

    tokio::spawn(async move {
        let outcome = drive(chunks, sink, chunk_tx).await;
        let _ = outcome_tx.send(outcome);
    });

    let mut handle = StreamHandle::new(meta, ReceiverStream::new(chunk_rx));
    if let Some(progress) = progress {
        handle = handle.with_progress(progress);
    }

    (handle, outcome_rx)
}

/// Pump the source into the sink and the consumer channel, lock-step.
async fn drive(
    mut source: ByteStream,
    sink: Box<dyn ChunkSink>,
    consumer: mpsc::Sender<Result<Bytes, TransferError>>,
) -> SinkOutcome {
    let mut sink = Some(sink);
    let mut consumer = Some(consumer);

    while let Some(item) = source.next().await {
        match item {
            Ok(chunk) => {
                // Sink first: the consumer never observes a byte the durable
                // branch has not been offered.
                if let Some(active) = sink.as_mut() {
                    if let Err(err) = active.write(&chunk).await {
                        warn!(error = %err, "sink write failed, continuing without it");
                        if let Some(failed) = sink.take() {
                            failed.abort().await;
                        }
                    }
                }

                let send_failed = match consumer.as_ref() {
                    Some(tx) => tx.send(Ok(chunk)).await.is_err(),
                    None => false,
                };
                if send_failed {
                    // Consumer went away. Keep draining into the sink so the
                    // cache write can still complete.
                    debug!("consumer dropped mid-transfer");
                    consumer = None;
                    if sink.is_none() {
                        return SinkOutcome::Degraded;
                    }
                }
            }
            Err(err) => {
                if let Some(failed) = sink.take() {
                    failed.abort().await;
                }
                if let Some(tx) = consumer.take() {
                    let _ = tx.send(Err(err)).await;
                }
                return SinkOutcome::SourceFailed;
            }
        }
    }

    // Commit before the consumer channel closes: end-of-stream on the
    // returned handle implies the cache entry is already durable.
    match sink {
        Some(active) => match active.commit().await {
            Ok(()) => SinkOutcome::Committed,
            Err(err) => {
                warn!(error = %err, "sink commit failed");
                SinkOutcome::Degraded
            }
        },
        None => SinkOutcome::Degraded,
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures_util::stream;

    use crate::stream::StreamMeta;

    use super::*;

    /// Shared journal of sink events, inspected after the transfer.
    #[derive(Debug, Default)]
    struct SinkLog {
        chunks: Vec<Bytes>,
        committed: bool,
        aborted: bool,
    }

    struct RecordingSink {
        log: Arc<Mutex<SinkLog>>,
        /// Per-chunk write delay, to model a slow disk.
        delay: Option<Duration>,
        /// Fail the write of the chunk with this index.
        fail_at: Option<usize>,
        written: usize,
    }

    impl RecordingSink {
        fn new(log: Arc<Mutex<SinkLog>>) -> Self {
            Self {
                log,
                delay: None,
                fail_at: None,
                written: 0,
            }
        }
    }

    #[async_trait]
    impl ChunkSink for RecordingSink {
        async fn write(&mut self, chunk: &Bytes) -> io::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_at == Some(self.written) {
                return Err(io::Error::other("injected write failure"));
            }
            self.written += 1;
            self.log.lock().unwrap().chunks.push(chunk.clone());
            Ok(())
        }

        async fn commit(self: Box<Self>) -> io::Result<()> {
            self.log.lock().unwrap().committed = true;
            Ok(())
        }

        async fn abort(self: Box<Self>) {
            self.log.lock().unwrap().aborted = true;
        }
    }

    fn meta() -> StreamMeta {
        StreamMeta {
            total_length: None,
            content_type: "application/octet-stream".to_string(),
        }
    }

    fn chunk_source(chunks: Vec<Result<Bytes, TransferError>>) -> StreamHandle {
        StreamHandle::new(meta(), stream::iter(chunks))
    }

    #[tokio::test]
    async fn duplicates_bytes_to_both_sides() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let source = chunk_source(vec![
            Ok(Bytes::from_static(b"one")),
            Ok(Bytes::from_static(b"two")),
            Ok(Bytes::from_static(b"three")),
        ]);

        let (mut handle, outcome) = tee(source, Box::new(RecordingSink::new(log.clone())));

        let mut consumed = Vec::new();
        while let Some(chunk) = handle.next().await {
            consumed.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(outcome.await.unwrap(), SinkOutcome::Committed);
        assert_eq!(consumed, b"onetwothree");

        let log = log.lock().unwrap();
        let sunk: Vec<u8> = log.chunks.iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(sunk, b"onetwothree");
        assert!(log.committed);
        assert!(!log.aborted);
    }

    #[tokio::test]
    async fn consumer_never_ahead_of_slow_sink() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let mut sink = RecordingSink::new(log.clone());
        sink.delay = Some(Duration::from_millis(10));

        let chunks: Vec<_> = (0u8..5)
            .map(|i| Ok(Bytes::from(vec![i; 4])))
            .collect();
        let (mut handle, outcome) = tee(chunk_source(chunks), Box::new(sink));

        let mut received = 0usize;
        while let Some(chunk) = handle.next().await {
            chunk.unwrap();
            received += 1;
            // Every chunk we hold has already been accepted by the sink.
            let offered = log.lock().unwrap().chunks.len();
            assert!(
                offered >= received,
                "consumer saw chunk {received} before the sink (sink at {offered})"
            );
        }

        assert_eq!(received, 5);
        assert_eq!(outcome.await.unwrap(), SinkOutcome::Committed);
    }

    #[tokio::test]
    async fn sink_failure_degrades_but_forwards() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let mut sink = RecordingSink::new(log.clone());
        sink.fail_at = Some(1);

        let source = chunk_source(vec![
            Ok(Bytes::from_static(b"aa")),
            Ok(Bytes::from_static(b"bb")),
            Ok(Bytes::from_static(b"cc")),
        ]);
        let (mut handle, outcome) = tee(source, Box::new(sink));

        let mut consumed = Vec::new();
        while let Some(chunk) = handle.next().await {
            consumed.extend_from_slice(&chunk.unwrap());
        }

        // The consumer branch stays whole even though caching was lost.
        assert_eq!(consumed, b"aabbcc");
        assert_eq!(outcome.await.unwrap(), SinkOutcome::Degraded);

        let log = log.lock().unwrap();
        assert!(log.aborted);
        assert!(!log.committed);
    }

    #[tokio::test]
    async fn source_failure_reaches_consumer_and_aborts_sink() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let source = chunk_source(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(TransferError::Upstream("connection reset".to_string())),
        ]);
        let (mut handle, outcome) = tee(source, Box::new(RecordingSink::new(log.clone())));

        let first = handle.next().await.unwrap();
        assert_eq!(first.unwrap(), Bytes::from_static(b"partial"));

        let second = handle.next().await.unwrap();
        assert!(matches!(second, Err(TransferError::Upstream(_))));
        assert!(handle.next().await.is_none());

        assert_eq!(outcome.await.unwrap(), SinkOutcome::SourceFailed);
        let log = log.lock().unwrap();
        assert!(log.aborted);
        assert!(!log.committed);
    }

    #[tokio::test]
    async fn commit_precedes_consumer_end_of_stream() {
        let log = Arc::new(Mutex::new(SinkLog::default()));
        let source = chunk_source(vec![Ok(Bytes::from_static(b"data"))]);
        let (mut handle, _outcome) = tee(source, Box::new(RecordingSink::new(log.clone())));

        handle.next().await.unwrap().unwrap();
        assert!(handle.next().await.is_none());

        // End-of-stream implies the sink already acknowledged the commit.
        assert!(log.lock().unwrap().committed);
    }
}
