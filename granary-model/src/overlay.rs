//! Overlay collaborator seam
//!
//! The trust-gated key/value overlay (sync protocol, peer gossip, access
//! control) lives behind these traits. Granary stores encoded meta entries in
//! it and reads them back by byte range; joining a feed's overlay only
//! succeeds once a trust chain from the feed owner to the caller is provable.

use crate::types::FeedKey;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by the overlay.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OverlayError {
    /// No trust chain from the feed owner to the caller. Recoverable: the
    /// feed simply has no overlay access yet.
    #[error("No trust chain to feed")]
    Untrusted,

    #[error("Timed out waiting for overlay peers")]
    Timeout,

    #[error("Overlay node closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(String),
}

/// Live subscription over a byte range of overlay entries.
///
/// New entries whose bytes fall inside the range arrive on `rx`. Release via
/// [`OverlayNode::unwatch`]; dropping the watcher without unwatching leaks
/// the server-side registration until the node is left.
pub struct OverlayWatcher {
    pub id: u64,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// A joined overlay node for one feed.
#[async_trait]
pub trait OverlayNode: Send + Sync {
    /// Insert an encoded entry. `min_peers` is the number of connected peers
    /// to wait for before inserting (0 = insert immediately); waiting is
    /// bounded by `timeout` and surfaces [`OverlayError::Timeout`].
    async fn insert(
        &self,
        entry: Vec<u8>,
        min_peers: usize,
        timeout: Duration,
    ) -> Result<(), OverlayError>;

    /// Snapshot read of all entries whose bytes fall in `[start, end)`.
    async fn request(&self, start: &[u8], end: &[u8]) -> Result<Vec<Vec<u8>>, OverlayError>;

    /// Subscribe to entries in `[start, end)`; unbounded upper end when
    /// `end` is `None`.
    async fn watch(&self, start: Vec<u8>, end: Option<Vec<u8>>) -> Result<OverlayWatcher, OverlayError>;

    /// Release a watcher registration.
    async fn unwatch(&self, watcher: OverlayWatcher);

    /// Number of peers currently connected for this feed.
    async fn peer_count(&self) -> usize;
}

/// The overlay engine: joins feeds and manages the local trust store.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Join the overlay for `feed_key`, requesting full replication when
    /// `full`. Fails with [`OverlayError::Untrusted`] while no trust chain
    /// can be proven.
    async fn join(&self, feed_key: FeedKey, full: bool) -> Result<Arc<dyn OverlayNode>, OverlayError>;

    /// Leave a previously joined feed.
    async fn leave(&self, feed_key: &FeedKey);

    /// Install a trust link into the local trust store under `root`. The
    /// link must verify against `root`'s public key; invalid links are
    /// rejected.
    async fn add_link(&self, root: FeedKey, link: &[u8]) -> Result<(), OverlayError>;
}
