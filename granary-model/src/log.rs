//! Log collaborator seam
//!
//! The append-only replicated log primitive (creation, Merkle integrity,
//! network replication) lives behind these traits. Granary only consumes it:
//! open a handle, append JSON values, read by index or as a stream.

use crate::types::FeedKey;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use futures_util::Stream;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a log handle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogError {
    #[error("No entry at index {0}")]
    NotFound(u64),

    #[error("Feed not writable")]
    NotWritable,

    #[error("Timed out waiting for log data")]
    Timeout,

    #[error("Log closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(String),
}

/// Where a log keeps its data.
#[derive(Clone, Debug)]
pub enum LogStorage {
    /// Durable on-disk backing for fully replicated feeds.
    Durable(PathBuf),
    /// In-memory backing for sparse, on-demand feeds.
    Ephemeral,
}

/// A (possibly live) stream of raw log values.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, LogError>> + Send>>;

/// Handle to one feed's append-only log.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Number of entries currently known locally.
    fn length(&self) -> u64;

    /// Append a value. Returns the new log length; the appended entry's
    /// index is `new_length - 1`. Fails with [`LogError::NotWritable`] on
    /// read-only handles.
    async fn append(&self, value: Vec<u8>) -> Result<u64, LogError>;

    /// Fetch the entry at `index`. [`LogError::NotFound`] past the end.
    async fn get(&self, index: u64) -> Result<Vec<u8>, LogError>;

    /// Block until remote content is available (used when the local replica
    /// is empty), bounded by `timeout`.
    async fn update(&self, timeout: Duration) -> Result<(), LogError>;

    /// Read entries `[start, end)`. When `end` is `None` the stream is live
    /// and unbounded: it follows new appends until dropped or the log is
    /// closed.
    fn read_stream(&self, start: u64, end: Option<u64>) -> LogStream;

    /// Release the handle. Live streams terminate.
    async fn close(&self);
}

/// Opens log handles. Implemented by the replication engine (or the
/// in-process sim in tests).
#[async_trait]
pub trait LogOpener: Send + Sync {
    /// Open the log for `feed_key`. A `secret_key` makes the handle
    /// writable; `sparse` requests partial, on-demand replication.
    async fn open(
        &self,
        storage: LogStorage,
        feed_key: FeedKey,
        secret_key: Option<SigningKey>,
        sparse: bool,
    ) -> Result<Arc<dyn MessageLog>, LogError>;
}
