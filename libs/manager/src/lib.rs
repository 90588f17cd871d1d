//! fleetimage manager
//!
//! Streaming acquisition pipeline for device images: fetch from the image
//! endpoint, cache on disk, and stage at temporary locations.
//!
//! ## Architecture
//!
//! ```text
//! ImageManager::get(slug)
//! ├── fresh  -> ImageCache::read_stream       (no tee, no progress)
//! └── stale  -> FetchSource::fetch
//!              └── tee ─┬─ CacheWriter        (spool + atomic commit)
//!                       └─ StreamHandle       (metadata + progress)
//! ```
//!
//! The tee is lock-step: a chunk reaches the consumer only after the cache
//! sink accepted it, and the consumer sees end-of-stream only after the
//! cache commit is durable. A cache that cannot be written degrades to
//! forward-without-caching; the consumer branch is never sacrificed for the
//! cache branch.
//!
//! ## Modules
//!
//! - `manager`: public acquisition surface
//! - `cache`: on-disk store with freshness and atomic commits
//! - `source`: remote origin abstraction and HTTP implementation
//! - `tee`: one-in, two-out stream duplication with backpressure
//! - `staging`: materialize a stream at a temporary path
//! - `extract`: archive unpacking for staged images

pub mod cache;
pub mod config;
pub mod extract;
pub mod manager;
pub mod source;
pub mod staging;
pub mod stream;
pub mod tee;

// Re-export commonly used types
pub use cache::{CacheReadError, CacheWriteError, CacheWriter, ImageCache, ImageCacheConfig};
pub use config::Config;
pub use extract::{ArchiveFormat, ExtractError};
pub use manager::{AcquireError, ImageManager};
pub use source::{FetchError, FetchSource, HttpFetchSource, HttpSourceConfig};
pub use staging::{stage, StagingConfig, StagingError};
pub use stream::{Progress, ProgressReceiver, StreamHandle, StreamMeta, TransferError};
pub use tee::{tee, ChunkSink, SinkOutcome};
