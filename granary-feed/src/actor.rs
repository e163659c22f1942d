//! FeedActor - owns the log handle and overlay node, processes commands in
//! arrival order.

use crate::{
    FeedError, FeedEvent, FeedState, MetaOutcome, TimelineEntry, WatchHandle, OVERLAY_TIMEOUT,
    SCRAPE_LIMIT, UPDATE_TIMEOUT,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use futures_util::StreamExt;
use granary_meta::{message_range_start, MetaEntry, MetaKey, MetaValue};
use granary_model::{
    kind, FeedKey, LogError, LogOpener, LogStorage, Message, MessageLog, Overlay, OverlayNode,
    OverlayWatcher, TrustPayload,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Static description of a feed to open.
pub struct FeedConfig {
    pub feed_key: FeedKey,
    /// Present for the locally writable feed.
    pub secret_key: Option<SigningKey>,
    pub storage: LogStorage,
    /// Full replication for local and followed feeds; sparse on-demand
    /// otherwise.
    pub replicate_fully: bool,
    pub update_timeout: Duration,
    pub overlay_timeout: Duration,
}

impl FeedConfig {
    /// Sparse, read-only, in-memory feed for on-demand lookups.
    pub fn sparse(feed_key: FeedKey) -> Self {
        Self {
            feed_key,
            secret_key: None,
            storage: LogStorage::Ephemeral,
            replicate_fully: false,
            update_timeout: UPDATE_TIMEOUT,
            overlay_timeout: OVERLAY_TIMEOUT,
        }
    }

    /// Fully replicated writable feed backed by `dir`.
    pub fn writable(feed_key: FeedKey, secret_key: SigningKey, dir: PathBuf) -> Self {
        Self {
            secret_key: Some(secret_key),
            storage: LogStorage::Durable(dir),
            replicate_fully: true,
            ..Self::sparse(feed_key)
        }
    }

    /// Fully replicated read-only replica of a followed feed.
    pub fn follower(feed_key: FeedKey, dir: PathBuf) -> Self {
        Self {
            storage: LogStorage::Durable(dir),
            replicate_fully: true,
            ..Self::sparse(feed_key)
        }
    }

    pub fn is_writable(&self) -> bool {
        self.secret_key.is_some()
    }

    pub fn is_sparse(&self) -> bool {
        !self.replicate_fully
    }
}

/// Commands sent to the feed actor.
pub(crate) enum FeedCmd {
    Append {
        kind: String,
        payload: serde_json::Value,
        resp: oneshot::Sender<Result<u64, FeedError>>,
    },
    AddMeta {
        index: u32,
        value: Option<MetaValue>,
        resp: oneshot::Sender<Result<MetaOutcome, FeedError>>,
    },
    GetTimeline {
        offset: u64,
        limit: u64,
        resp: oneshot::Sender<Result<Vec<TimelineEntry>, FeedError>>,
    },
    GetMessage {
        index: u64,
        resp: oneshot::Sender<Result<TimelineEntry, FeedError>>,
    },
    Watch {
        start: u64,
        end: Option<u64>,
        resp: oneshot::Sender<Result<WatchHandle, FeedError>>,
    },
    Unwatch {
        watcher: OverlayWatcher,
        resp: oneshot::Sender<()>,
    },
    Length {
        resp: oneshot::Sender<u64>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

pub(crate) struct FeedActor {
    config: FeedConfig,
    opener: Arc<dyn LogOpener>,
    overlay: Arc<dyn Overlay>,
    rx: mpsc::Receiver<FeedCmd>,
    state_tx: watch::Sender<FeedState>,
    event_tx: broadcast::Sender<FeedEvent>,
    joined: bool,
}

impl FeedActor {
    pub(crate) fn new(
        config: FeedConfig,
        opener: Arc<dyn LogOpener>,
        overlay: Arc<dyn Overlay>,
        rx: mpsc::Receiver<FeedCmd>,
        state_tx: watch::Sender<FeedState>,
        event_tx: broadcast::Sender<FeedEvent>,
    ) -> Self {
        Self { config, opener, overlay, rx, state_tx, event_tx, joined: false }
    }

    pub(crate) async fn run(mut self) {
        let (log, node) = match self.bring_up().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(feed = %self.config.feed_key, error = %e, "feed bring-up failed");
                let _ = self.state_tx.send(FeedState::Failed);
                self.fail_pending(e).await;
                return;
            }
        };

        let _ = self.state_tx.send(FeedState::Ready);
        let _ = self.event_tx.send(FeedEvent::Ready);
        info!(feed = %self.config.feed_key, length = log.length(), "feed ready");

        loop {
            let Some(cmd) = self.rx.recv().await else {
                // All handles dropped.
                break;
            };
            if let FeedCmd::Close { resp } = cmd {
                self.release(&log).await;
                let _ = resp.send(());
                return;
            }
            self.handle_command(cmd, &log, &node).await;
        }
        self.release(&log).await;
    }

    async fn release(&mut self, log: &Arc<dyn MessageLog>) {
        log.close().await;
        if self.joined {
            self.overlay.leave(&self.config.feed_key).await;
        }
        let _ = self.state_tx.send(FeedState::Closed);
        debug!(feed = %self.config.feed_key, "feed closed");
    }

    /// Answer every queued command with the bring-up failure.
    async fn fail_pending(&mut self, err: FeedError) {
        self.rx.close();
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                FeedCmd::Append { resp, .. } => {
                    let _ = resp.send(Err(err.clone()));
                }
                FeedCmd::AddMeta { resp, .. } => {
                    let _ = resp.send(Err(err.clone()));
                }
                FeedCmd::GetTimeline { resp, .. } => {
                    let _ = resp.send(Err(err.clone()));
                }
                FeedCmd::GetMessage { resp, .. } => {
                    let _ = resp.send(Err(err.clone()));
                }
                FeedCmd::Watch { resp, .. } => {
                    let _ = resp.send(Err(err.clone()));
                }
                FeedCmd::Unwatch { resp, .. } => {
                    let _ = resp.send(());
                }
                FeedCmd::Length { resp } => {
                    let _ = resp.send(0);
                }
                FeedCmd::Close { resp } => {
                    let _ = resp.send(());
                }
            }
        }
    }

    /// Bring-up sequence: overlay join, log open, initial update, and a
    /// single trust-scrape retry when the join was refused.
    async fn bring_up(
        &mut self,
    ) -> Result<(Arc<dyn MessageLog>, Option<Arc<dyn OverlayNode>>), FeedError> {
        let feed_key = self.config.feed_key;
        let writable = self.config.is_writable();

        let _ = self.state_tx.send(FeedState::JoiningOverlay);
        let mut node = match self.overlay.join(feed_key, self.config.replicate_fully).await {
            Ok(node) => Some(node),
            Err(e) if writable => {
                // The owner always has overlay access to its own key.
                return Err(FeedError::Failed(format!("overlay join: {}", e)));
            }
            Err(e) => {
                debug!(feed = %feed_key, error = %e, "no overlay access yet");
                None
            }
        };
        self.joined = node.is_some();

        let _ = self.state_tx.send(FeedState::OpeningLog);
        let log = self
            .opener
            .open(
                self.config.storage.clone(),
                feed_key,
                self.config.secret_key.clone(),
                self.config.is_sparse(),
            )
            .await?;

        if log.length() == 0 && !writable {
            // Pull remote content before answering reads from an empty
            // replica. A timeout just means nobody had data in time.
            match log.update(self.config.update_timeout).await {
                Ok(()) => {}
                Err(LogError::Timeout) => {
                    debug!(feed = %feed_key, "log update timed out, replica still empty");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if node.is_none() {
            let _ = self.state_tx.send(FeedState::RetryingTrust);
            self.scrape_trust(&log).await?;
            node = match self.overlay.join(feed_key, self.config.replicate_fully).await {
                Ok(n) => {
                    self.joined = true;
                    Some(n)
                }
                Err(e) => {
                    debug!(feed = %feed_key, error = %e, "overlay join retry failed");
                    None
                }
            };
        }

        Ok((log, node))
    }

    /// Scan the trailing window of the log for trust messages. Links found
    /// there are installed under this feed's key so the join retry can use
    /// them; each message is also broadcast for the orchestrator.
    async fn scrape_trust(&self, log: &Arc<dyn MessageLog>) -> Result<(), FeedError> {
        let len = log.length();
        if len == 0 {
            return Ok(());
        }
        let start = len.saturating_sub(SCRAPE_LIMIT);
        let mut stream = log.read_stream(start, Some(len));
        while let Some(item) = stream.next().await {
            let raw = item?;
            let Ok(message) = Message::from_bytes(&raw) else {
                continue;
            };
            if message.kind != kind::TRUST {
                continue;
            }
            if let Ok(payload) = serde_json::from_value::<TrustPayload>(message.payload.clone()) {
                if let Ok(link) = BASE64.decode(&payload.link) {
                    if let Err(e) = self.overlay.add_link(self.config.feed_key, &link).await {
                        debug!(feed = %self.config.feed_key, error = %e, "scraped link rejected");
                    }
                }
            }
            let _ = self.event_tx.send(FeedEvent::TrustObserved(message));
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        cmd: FeedCmd,
        log: &Arc<dyn MessageLog>,
        node: &Option<Arc<dyn OverlayNode>>,
    ) {
        match cmd {
            FeedCmd::Append { kind, payload, resp } => {
                let _ = resp.send(self.append(kind, payload, log).await);
            }
            FeedCmd::AddMeta { index, value, resp } => {
                let _ = resp.send(self.add_meta(index, value, node).await);
            }
            FeedCmd::GetTimeline { offset, limit, resp } => {
                let _ = resp.send(self.get_timeline(offset, limit, log, node).await);
            }
            FeedCmd::GetMessage { index, resp } => {
                let _ = resp.send(self.get_message(index, log, node).await);
            }
            FeedCmd::Watch { start, end, resp } => {
                let _ = resp.send(Self::watch(start, end, log, node).await);
            }
            FeedCmd::Unwatch { watcher, resp } => {
                if let Some(node) = node {
                    node.unwatch(watcher).await;
                }
                let _ = resp.send(());
            }
            FeedCmd::Length { resp } => {
                let _ = resp.send(log.length());
            }
            FeedCmd::Close { .. } => {}
        }
    }

    async fn append(
        &self,
        kind: String,
        payload: serde_json::Value,
        log: &Arc<dyn MessageLog>,
    ) -> Result<u64, FeedError> {
        if !self.config.is_writable() {
            return Err(FeedError::NotWritable);
        }
        let message = Message::now(kind, payload);
        let new_length = log.append(message.to_bytes()?).await?;
        // The index is read back from the log, never predicted.
        Ok(new_length - 1)
    }

    async fn add_meta(
        &self,
        index: u32,
        value: Option<MetaValue>,
        node: &Option<Arc<dyn OverlayNode>>,
    ) -> Result<MetaOutcome, FeedError> {
        let Some(node) = node else {
            debug!(feed = %self.config.feed_key, index, "no overlay access, meta insert skipped");
            return Ok(MetaOutcome::Skipped);
        };
        let entry = MetaEntry::new(MetaKey::Message { index }, value).encode()?;
        // A sparse feed waits for a peer: otherwise the insert lands on an
        // island nobody replicates from.
        let min_peers = if self.config.is_sparse() { 1 } else { 0 };
        node.insert(entry, min_peers, self.config.overlay_timeout).await?;
        Ok(MetaOutcome::Inserted)
    }

    async fn get_timeline(
        &self,
        offset: u64,
        limit: u64,
        log: &Arc<dyn MessageLog>,
        node: &Option<Arc<dyn OverlayNode>>,
    ) -> Result<Vec<TimelineEntry>, FeedError> {
        if log.length() == 0 {
            match log.update(self.config.update_timeout).await {
                Ok(()) | Err(LogError::Timeout) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let len = log.length();
        let end = len.saturating_sub(offset);
        let start = end.saturating_sub(limit);
        if start >= end {
            return Ok(Vec::new());
        }

        let (messages, meta) = tokio::join!(
            Self::collect_window(log, start, end),
            Self::fetch_meta(node, meta_index(start), meta_index(end)),
        );
        let (messages, meta) = (messages?, meta?);

        let mut entries: Vec<TimelineEntry> = messages
            .into_iter()
            .enumerate()
            .map(|(i, message)| TimelineEntry {
                index: start + i as u64,
                message,
                meta: Vec::new(),
            })
            .collect();
        attach_meta(&mut entries, start, meta);
        Ok(entries)
    }

    async fn get_message(
        &self,
        index: u64,
        log: &Arc<dyn MessageLog>,
        node: &Option<Arc<dyn OverlayNode>>,
    ) -> Result<TimelineEntry, FeedError> {
        if index >= log.length() {
            return Err(FeedError::NotFound(index));
        }
        let i = meta_index(index);
        let (raw, meta) = tokio::join!(
            log.get(index),
            Self::fetch_meta(node, i, i.saturating_add(1)),
        );
        let message = Message::from_bytes(&raw?)?;

        let mut entries = [TimelineEntry { index, message, meta: Vec::new() }];
        attach_meta(&mut entries, index, meta?);
        let [entry] = entries;
        Ok(entry)
    }

    async fn watch(
        start: u64,
        end: Option<u64>,
        log: &Arc<dyn MessageLog>,
        node: &Option<Arc<dyn OverlayNode>>,
    ) -> Result<WatchHandle, FeedError> {
        let messages = log.read_stream(start, end);
        let meta = match node {
            Some(node) => Some(
                node.watch(
                    message_range_start(meta_index(start)),
                    end.map(|e| message_range_start(meta_index(e))),
                )
                .await?,
            ),
            None => None,
        };
        Ok(WatchHandle { messages, meta })
    }

    async fn collect_window(
        log: &Arc<dyn MessageLog>,
        start: u64,
        end: u64,
    ) -> Result<Vec<Message>, FeedError> {
        let mut stream = log.read_stream(start, Some(end));
        let mut out = Vec::with_capacity((end - start) as usize);
        while let Some(item) = stream.next().await {
            out.push(Message::from_bytes(&item?)?);
        }
        Ok(out)
    }

    async fn fetch_meta(
        node: &Option<Arc<dyn OverlayNode>>,
        start: u32,
        end: u32,
    ) -> Result<Vec<Vec<u8>>, FeedError> {
        let Some(node) = node else {
            return Ok(Vec::new());
        };
        // A key-only envelope is both the inclusive start bound of its own
        // index and the exclusive end bound of the previous one.
        Ok(node.request(&message_range_start(start), &message_range_start(end)).await?)
    }
}

/// Overlay keys only address the u32 index space.
fn meta_index(index: u64) -> u32 {
    index.min(u32::MAX as u64) as u32
}

/// Decode overlay entries and attach their values to the window starting at
/// `start`. Malformed entries, non-message keys, value-less entries and
/// out-of-window indices are dropped; response order is preserved per
/// message.
fn attach_meta(entries: &mut [TimelineEntry], start: u64, raw: Vec<Vec<u8>>) {
    for bytes in raw {
        let Ok(decoded) = MetaEntry::decode(&bytes) else {
            continue;
        };
        let Some(index) = decoded.key.message_index() else {
            continue;
        };
        let Some(value) = decoded.value else {
            continue;
        };
        let Some(slot) = (index as u64)
            .checked_sub(start)
            .and_then(|offset| entries.get_mut(offset as usize))
        else {
            continue;
        };
        slot.meta.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64) -> TimelineEntry {
        TimelineEntry {
            index,
            message: Message::now("post", serde_json::json!({})),
            meta: Vec::new(),
        }
    }

    fn reply_bytes(on: u32, from_index: u32) -> Vec<u8> {
        MetaEntry::new(
            MetaKey::Message { index: on },
            Some(MetaValue::Reply { feed_key: FeedKey([9u8; 32]), index: from_index }),
        )
        .encode()
        .unwrap()
    }

    #[test]
    fn test_attach_meta_places_values_by_index() {
        let mut entries = [entry(10), entry(11), entry(12)];
        attach_meta(&mut entries, 10, vec![reply_bytes(11, 0), reply_bytes(11, 3), reply_bytes(12, 1)]);
        assert!(entries[0].meta.is_empty());
        assert_eq!(entries[1].meta.len(), 2);
        assert_eq!(entries[2].meta.len(), 1);
        // Response order preserved, no dedup.
        assert_eq!(
            entries[1].meta[0],
            MetaValue::Reply { feed_key: FeedKey([9u8; 32]), index: 0 }
        );
    }

    #[test]
    fn test_attach_meta_drops_noise() {
        let mut entries = [entry(0)];
        let key_only = MetaEntry::new(MetaKey::Message { index: 0 }, None).encode().unwrap();
        let unknown_key = MetaEntry::new(
            MetaKey::Unknown(vec![7, 7]),
            Some(MetaValue::Unknown(vec![1])),
        )
        .encode()
        .unwrap();
        attach_meta(
            &mut entries,
            0,
            vec![
                vec![0xff],       // malformed
                key_only,         // no value
                unknown_key,      // not a message key
                reply_bytes(5, 0), // out of window
            ],
        );
        assert!(entries[0].meta.is_empty());
    }

    #[test]
    fn test_window_arithmetic_clamps_at_zero() {
        // end = len - offset, start = end - limit, both saturating.
        let len: u64 = 3;
        let end = len.saturating_sub(10);
        assert_eq!(end, 0);
        let start = end.saturating_sub(5);
        assert_eq!(start, 0);
    }
}
