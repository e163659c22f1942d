//! Feed lifecycle and timeline assembly
//!
//! A [`Feed`] is a cloneable handle over one identity's append-only log plus
//! its trust-gated metadata overlay. A dedicated actor task owns the log
//! handle and the (optional) overlay node and processes commands strictly in
//! arrival order. Bring-up runs inside the actor task before the command
//! loop starts, so operations issued against a feed that is still opening
//! queue in the channel and flush in order once the feed is ready.

mod actor;
mod handle;

pub use actor::FeedConfig;
pub use handle::Feed;

use granary_meta::{MetaError, MetaValue};
use granary_model::{LogError, LogStream, Message, OverlayError, OverlayWatcher};
use std::time::Duration;
use thiserror::Error;

/// How many trailing log entries are scanned for trust evidence when a
/// sparse feed comes up without overlay access.
pub const SCRAPE_LIMIT: u64 = 100;

/// Bound on overlay peer waits.
pub const OVERLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the initial log update when the local replica is empty.
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("Feed not writable")]
    NotWritable,

    #[error("No message at index {0}")]
    NotFound(u64),

    /// Bring-up failed; the feed never reached ready.
    #[error("Feed failed to open: {0}")]
    Failed(String),

    #[error("Feed closed")]
    Closed,

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("Meta error: {0}")]
    Meta(#[from] MetaError),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Encoding(e.to_string())
    }
}

/// Feed lifecycle, published on a `watch` channel.
///
/// `Ready`, `Failed` and `Closed` are terminal for bring-up purposes:
/// `Failed` means the feed never opened, `Closed` that it was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedState {
    Initializing,
    JoiningOverlay,
    OpeningLog,
    /// Sparse feed without overlay access, scanning its log for trust
    /// evidence before retrying the join.
    RetryingTrust,
    Ready,
    Failed,
    Closed,
}

/// Events broadcast by the feed actor.
#[derive(Clone, Debug)]
pub enum FeedEvent {
    /// Bring-up finished; queued operations are flushing.
    Ready,
    /// A trust message was found while scanning the log.
    TrustObserved(Message),
}

/// Outcome of a meta insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaOutcome {
    /// Entry inserted into the overlay.
    Inserted,
    /// No overlay access; the insert was dropped.
    Skipped,
}

/// One message of a timeline with its overlay annotations.
#[derive(Debug)]
pub struct TimelineEntry {
    pub index: u64,
    pub message: Message,
    /// Overlay values keyed on this message, in overlay response order.
    pub meta: Vec<MetaValue>,
}

/// Live views returned by [`Feed::watch`].
pub struct WatchHandle {
    /// Log values from the requested start, live when unbounded.
    pub messages: LogStream,
    /// Overlay entries in the matching key range, when overlay access
    /// exists.
    pub meta: Option<OverlayWatcher>,
}
