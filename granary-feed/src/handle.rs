//! Feed - cloneable handle to a feed actor.

use crate::actor::{FeedActor, FeedCmd, FeedConfig};
use crate::{FeedError, FeedEvent, FeedState, MetaOutcome, TimelineEntry, WatchHandle};
use granary_meta::MetaValue;
use granary_model::{FeedKey, LogOpener, Overlay, OverlayWatcher};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

const CMD_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 64;

/// A handle to one feed.
///
/// Cloning is cheap; every clone talks to the same actor. Operations issued
/// before bring-up finishes queue in the command channel and execute in
/// order once the feed is ready.
pub struct Feed {
    feed_key: FeedKey,
    writable: bool,
    tx: mpsc::Sender<FeedCmd>,
    state_rx: watch::Receiver<FeedState>,
    event_tx: broadcast::Sender<FeedEvent>,
}

impl Clone for Feed {
    fn clone(&self) -> Self {
        Self {
            feed_key: self.feed_key,
            writable: self.writable,
            tx: self.tx.clone(),
            state_rx: self.state_rx.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("feed_key", &self.feed_key)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl Feed {
    /// Open a feed and spawn its actor. The handle is usable immediately.
    pub fn open(config: FeedConfig, opener: Arc<dyn LogOpener>, overlay: Arc<dyn Overlay>) -> Feed {
        let (tx, rx) = mpsc::channel(CMD_BUFFER);
        let (state_tx, state_rx) = watch::channel(FeedState::Initializing);
        let (event_tx, _event_rx) = broadcast::channel(EVENT_BUFFER);

        let feed_key = config.feed_key;
        let writable = config.is_writable();
        let actor = FeedActor::new(config, opener, overlay, rx, state_tx, event_tx.clone());
        tokio::spawn(actor.run());

        Feed { feed_key, writable, tx, state_rx, event_tx }
    }

    pub fn feed_key(&self) -> FeedKey {
        self.feed_key
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FeedState {
        *self.state_rx.borrow()
    }

    /// Subscribe to feed events (ready, trust observations).
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.event_tx.subscribe()
    }

    /// Wait until bring-up finishes. `Failed` and `Closed` surface as
    /// errors.
    pub async fn wait_ready(&self) -> Result<(), FeedError> {
        let mut rx = self.state_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                FeedState::Ready => return Ok(()),
                FeedState::Failed => return Err(FeedError::Failed("bring-up failed".into())),
                FeedState::Closed => return Err(FeedError::Closed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(FeedError::Closed);
            }
        }
    }

    /// Append a message. Returns the index the log assigned.
    pub async fn append(
        &self,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<u64, FeedError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(FeedCmd::Append { kind: kind.into(), payload, resp: resp_tx })
            .await
            .map_err(|_| FeedError::Closed)?;
        resp_rx.await.map_err(|_| FeedError::Closed)?
    }

    /// Attach an overlay value to the message at `index`.
    pub async fn add_meta(
        &self,
        index: u32,
        value: Option<MetaValue>,
    ) -> Result<MetaOutcome, FeedError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(FeedCmd::AddMeta { index, value, resp: resp_tx })
            .await
            .map_err(|_| FeedError::Closed)?;
        resp_rx.await.map_err(|_| FeedError::Closed)?
    }

    /// Annotate the message at `index` with a reply link pointing at
    /// `reply_index` in `feed_key`'s log.
    pub async fn add_reply(
        &self,
        index: u32,
        feed_key: FeedKey,
        reply_index: u32,
    ) -> Result<MetaOutcome, FeedError> {
        self.add_meta(index, Some(MetaValue::Reply { feed_key, index: reply_index })).await
    }

    /// The newest `limit` messages older than the newest `offset`, merged
    /// with their overlay annotations, ascending by index.
    pub async fn get_timeline(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<TimelineEntry>, FeedError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(FeedCmd::GetTimeline { offset, limit, resp: resp_tx })
            .await
            .map_err(|_| FeedError::Closed)?;
        resp_rx.await.map_err(|_| FeedError::Closed)?
    }

    /// One message with its overlay annotations.
    pub async fn get_message(&self, index: u64) -> Result<TimelineEntry, FeedError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(FeedCmd::GetMessage { index, resp: resp_tx })
            .await
            .map_err(|_| FeedError::Closed)?;
        resp_rx.await.map_err(|_| FeedError::Closed)?
    }

    /// Live views over log values and overlay entries from `start`.
    pub async fn watch(&self, start: u64, end: Option<u64>) -> Result<WatchHandle, FeedError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(FeedCmd::Watch { start, end, resp: resp_tx })
            .await
            .map_err(|_| FeedError::Closed)?;
        resp_rx.await.map_err(|_| FeedError::Closed)?
    }

    /// Release the overlay side of a watch. The log stream side just gets
    /// dropped by the caller.
    pub async fn unwatch(&self, watcher: OverlayWatcher) {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.tx.send(FeedCmd::Unwatch { watcher, resp: resp_tx }).await.is_ok() {
            let _ = resp_rx.await;
        }
    }

    /// Number of locally known messages.
    pub async fn length(&self) -> u64 {
        let (resp_tx, resp_rx) = oneshot::channel();
        let _ = self.tx.send(FeedCmd::Length { resp: resp_tx }).await;
        resp_rx.await.unwrap_or(0)
    }

    /// Close the feed: releases the log, leaves the overlay, ends the
    /// actor. Later operations on any clone fail with [`FeedError::Closed`].
    pub async fn close(&self) {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.tx.send(FeedCmd::Close { resp: resp_tx }).await.is_ok() {
            let _ = resp_rx.await;
        }
    }
}
