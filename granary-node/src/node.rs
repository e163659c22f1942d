//! Node - orchestrator over the local feed, follow graph and trust.
//!
//! Every state change goes through the local log: `follow`, `unfollow` and
//! `trust` are appended as messages and take effect when the self-message
//! loop replays them. The log is the single source of truth; restarting a
//! node rebuilds the follow set and trust grants from it.

use crate::{DataDir, FeedRegistry, TrustStore, TrustStoreError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::StreamExt;
use granary_feed::{Feed, FeedConfig, FeedError, TimelineEntry, WatchHandle};
use granary_model::trust::unix_now;
use granary_model::{
    kind, FeedIdentity, FeedKey, FollowPayload, IdentityError, LogOpener, Message, OpenPayload,
    Overlay, PostPayload, ReplyTo, TrustLink, TrustPayload,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default lifetime of an issued trust link: one year.
pub const DEFAULT_TRUST_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Trust store error: {0}")]
    TrustStore(#[from] TrustStoreError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Builder incomplete: {0}")]
    Config(&'static str),
}

/// Options for issuing a trust link.
pub struct TrustOptions {
    pub expires_in: Duration,
    pub description: Option<String>,
}

impl Default for TrustOptions {
    fn default() -> Self {
        Self { expires_in: DEFAULT_TRUST_EXPIRATION, description: None }
    }
}

/// The message a post replies to.
#[derive(Clone, Copy, Debug)]
pub struct ReplyTarget {
    pub feed_key: FeedKey,
    pub index: u32,
}

pub struct NodeBuilder {
    data_dir: DataDir,
    log_opener: Arc<dyn LogOpener>,
    overlay_factory: Option<Box<dyn FnOnce(FeedKey) -> Arc<dyn Overlay> + Send>>,
}

impl NodeBuilder {
    pub fn new(data_dir: DataDir, log_opener: Arc<dyn LogOpener>) -> Self {
        Self { data_dir, log_opener, overlay_factory: None }
    }

    /// Set the overlay factory. The factory runs once the node identity is
    /// known, so the overlay engine can bind to it.
    pub fn with_overlay<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(FeedKey) -> Arc<dyn Overlay> + Send + 'static,
    {
        self.overlay_factory = Some(Box::new(factory));
        self
    }

    pub async fn start(self) -> Result<Node, NodeError> {
        let factory =
            self.overlay_factory.ok_or(NodeError::Config("overlay factory not set"))?;
        self.data_dir.ensure_dirs()?;

        let (identity, is_new) =
            FeedIdentity::load_or_generate(self.data_dir.identity_key())?;
        let feed_key = identity.feed_key();
        info!(feed = %feed_key, new = is_new, "starting node");

        let overlay = factory(feed_key);
        let trust_store = TrustStore::open(self.data_dir.trust_db())?;
        // Trust survives restarts: replay persisted links into the overlay.
        for (root, link) in trust_store.all()? {
            if let Err(e) = overlay.add_link(root, &link).await {
                debug!(root = %root, error = %e, "persisted link no longer valid");
            }
        }

        let feed_dir = self.data_dir.ensure_feed_dir(&feed_key)?;
        let local = Feed::open(
            FeedConfig::writable(feed_key, identity.signing_key().clone(), feed_dir),
            self.log_opener.clone(),
            overlay.clone(),
        );
        local.wait_ready().await?;
        if local.length().await == 0 {
            local.append(kind::OPEN, serde_json::to_value(OpenPayload::default())?).await?;
        }

        let registry = FeedRegistry::new();
        registry.insert(feed_key, local.clone());

        let inner = Arc::new(NodeInner {
            data_dir: self.data_dir,
            identity,
            feed_key,
            log_opener: self.log_opener,
            overlay,
            trust_store,
            registry,
            local: local.clone(),
            shutdown: CancellationToken::new(),
            watchers: Mutex::new(HashMap::new()),
        });

        // The self-message loop: replay the whole log from index 0, then
        // follow it live, one message at a time in log order.
        let watch = local.watch(0, None).await?;
        let loop_inner = inner.clone();
        let self_loop = tokio::spawn(async move {
            let WatchHandle { mut messages, meta } = watch;
            if let Some(meta) = meta {
                loop_inner.local.unwatch(meta).await;
            }
            loop {
                tokio::select! {
                    _ = loop_inner.shutdown.cancelled() => break,
                    item = messages.next() => match item {
                        Some(Ok(raw)) => loop_inner.handle_self_message(&raw).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "self log stream error");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(Node { inner, self_loop: Mutex::new(Some(self_loop)) })
    }
}

struct NodeInner {
    data_dir: DataDir,
    identity: FeedIdentity,
    feed_key: FeedKey,
    log_opener: Arc<dyn LogOpener>,
    overlay: Arc<dyn Overlay>,
    trust_store: TrustStore,
    registry: FeedRegistry,
    local: Feed,
    shutdown: CancellationToken,
    watchers: Mutex<HashMap<FeedKey, JoinHandle<()>>>,
}

impl NodeInner {
    async fn handle_self_message(self: &Arc<Self>, raw: &[u8]) {
        let message = match Message::from_bytes(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable message in own log");
                return;
            }
        };
        match message.kind.as_str() {
            kind::FOLLOW => self.on_follow(&message).await,
            kind::UNFOLLOW => self.on_unfollow(&message).await,
            kind::TRUST => self.install_trust(&self.feed_key, &message).await,
            kind::OPEN | kind::POST => {}
            other => debug!(kind = other, "unhandled message kind"),
        }
    }

    async fn on_follow(self: &Arc<Self>, message: &Message) {
        let Some(key) = payload_key(message) else {
            warn!("follow message with invalid feed key dropped");
            return;
        };
        if key == self.feed_key || self.registry.contains(&key) {
            return;
        }
        let dir = match self.data_dir.ensure_feed_dir(&key) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(feed = %key, error = %e, "cannot create feed storage");
                return;
            }
        };
        info!(feed = %key, "following");
        let feed = Feed::open(
            FeedConfig::follower(key, dir),
            self.log_opener.clone(),
            self.overlay.clone(),
        );
        self.registry.insert(key, feed.clone());

        let inner = self.clone();
        let task = tokio::spawn(async move { inner.watch_followed(key, feed).await });
        self.watchers.lock().unwrap().insert(key, task);
    }

    async fn on_unfollow(&self, message: &Message) {
        let Some(key) = payload_key(message) else {
            warn!("unfollow message with invalid feed key dropped");
            return;
        };
        if key == self.feed_key {
            return;
        }
        // Removal is keyed exactly like insertion.
        if let Some(task) = self.watchers.lock().unwrap().remove(&key) {
            task.abort();
        }
        if let Some(feed) = self.registry.remove(&key) {
            info!(feed = %key, "unfollowed");
            feed.close().await;
        }
    }

    /// Follow a feed's log live and extend trust from it: trust messages
    /// found in a followed feed install links under that feed's key.
    async fn watch_followed(self: Arc<Self>, key: FeedKey, feed: Feed) {
        let watch = match feed.watch(0, None).await {
            Ok(watch) => watch,
            Err(e) => {
                warn!(feed = %key, error = %e, "cannot watch followed feed");
                return;
            }
        };
        let WatchHandle { mut messages, meta } = watch;
        if let Some(meta) = meta {
            feed.unwatch(meta).await;
        }
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                item = messages.next() => match item {
                    Some(Ok(raw)) => {
                        if let Ok(message) = Message::from_bytes(&raw) {
                            if message.kind == kind::TRUST {
                                self.install_trust(&key, &message).await;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!(feed = %key, error = %e, "followed feed stream error");
                    }
                    None => break,
                },
            }
        }
    }

    /// Install the link carried by a trust message into the overlay and
    /// persist it. Invalid payloads and rejected links are dropped, never
    /// fatal.
    async fn install_trust(&self, root: &FeedKey, message: &Message) {
        let Ok(payload) = serde_json::from_value::<TrustPayload>(message.payload.clone()) else {
            warn!(root = %root, "trust message with invalid payload dropped");
            return;
        };
        let Ok(link) = BASE64.decode(&payload.link) else {
            warn!(root = %root, "trust message with undecodable link dropped");
            return;
        };
        if let Err(e) = self.overlay.add_link(*root, &link).await {
            debug!(root = %root, error = %e, "link rejected by overlay");
            return;
        }
        match TrustLink::parse(&link) {
            Ok(parsed) => {
                if let Err(e) = self.trust_store.install(root, &parsed.grantee, &link) {
                    warn!(root = %root, error = %e, "link not persisted");
                }
            }
            Err(e) => debug!(root = %root, error = %e, "unparseable link not persisted"),
        }
    }

    /// Run `f` against the feed for `feed_key`: a registered feed when one
    /// exists, otherwise a scoped ephemeral sparse feed closed afterwards
    /// regardless of the outcome.
    async fn with_feed<F, Fut, T>(&self, feed_key: FeedKey, f: F) -> Result<T, NodeError>
    where
        F: FnOnce(Feed) -> Fut,
        Fut: Future<Output = Result<T, FeedError>>,
    {
        if let Some(feed) = self.registry.get(&feed_key) {
            return Ok(f(feed).await?);
        }
        let feed = Feed::open(
            FeedConfig::sparse(feed_key),
            self.log_opener.clone(),
            self.overlay.clone(),
        );
        let result = f(feed.clone()).await;
        feed.close().await;
        Ok(result?)
    }
}

fn payload_key(message: &Message) -> Option<FeedKey> {
    let payload: FollowPayload = serde_json::from_value(message.payload.clone()).ok()?;
    FeedKey::from_base64(&payload.feed_key).ok()
}

/// A running node.
pub struct Node {
    inner: Arc<NodeInner>,
    self_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn feed_key(&self) -> FeedKey {
        self.inner.feed_key
    }

    /// Handle to the node's own feed.
    pub fn local_feed(&self) -> Feed {
        self.inner.local.clone()
    }

    /// Feeds currently followed.
    pub fn following(&self) -> Vec<FeedKey> {
        self.inner
            .registry
            .keys()
            .into_iter()
            .filter(|key| *key != self.inner.feed_key)
            .collect()
    }

    /// Issue a trust link for `target` and record the grant in the local
    /// log. Installation happens when the self-message loop replays the
    /// record, never directly; returns the raw link for out-of-band
    /// delivery.
    pub async fn trust(
        &self,
        target: FeedKey,
        options: TrustOptions,
    ) -> Result<Vec<u8>, NodeError> {
        let expires_at = unix_now() + options.expires_in.as_secs();
        let link = TrustLink::issue(&self.inner.identity, target, expires_at);
        let payload = TrustPayload {
            feed_key: target.to_base64(),
            expires_at,
            link: BASE64.encode(&link),
            description: options.description,
        };
        self.inner.local.append(kind::TRUST, serde_json::to_value(&payload)?).await?;
        Ok(link)
    }

    /// Record a follow. The follow set updates asynchronously through the
    /// self-message loop.
    pub async fn follow(&self, feed_key: FeedKey) -> Result<u64, NodeError> {
        let payload = FollowPayload { feed_key: feed_key.to_base64() };
        Ok(self.inner.local.append(kind::FOLLOW, serde_json::to_value(&payload)?).await?)
    }

    /// Record an unfollow.
    pub async fn unfollow(&self, feed_key: FeedKey) -> Result<u64, NodeError> {
        let payload = FollowPayload { feed_key: feed_key.to_base64() };
        Ok(self.inner.local.append(kind::UNFOLLOW, serde_json::to_value(&payload)?).await?)
    }

    /// Publish a post. A reply additionally annotates the target message
    /// in the other feed's overlay; a failed annotation never undoes the
    /// post.
    pub async fn post(
        &self,
        content: impl Into<String>,
        reply_to: Option<ReplyTarget>,
    ) -> Result<u64, NodeError> {
        let reply = reply_to
            .map(|target| ReplyTo { feed_key: target.feed_key.to_base64(), index: target.index });
        let payload = PostPayload { content: content.into(), reply_to: reply };
        let index = self.inner.local.append(kind::POST, serde_json::to_value(&payload)?).await?;

        if let Some(target) = reply_to {
            if let Err(e) = self.add_reply_link(target, index).await {
                warn!(target = %target.feed_key, error = %e, "reply link not recorded");
            }
        }
        Ok(index)
    }

    async fn add_reply_link(&self, target: ReplyTarget, post_index: u64) -> Result<(), NodeError> {
        let own_key = self.inner.feed_key;
        let post_index = post_index.min(u32::MAX as u64) as u32;
        self.inner
            .with_feed(target.feed_key, |feed| async move {
                feed.add_reply(target.index, own_key, post_index).await.map(|_| ())
            })
            .await
    }

    /// Timeline of any feed, followed or not.
    pub async fn get_timeline(
        &self,
        feed_key: FeedKey,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<TimelineEntry>, NodeError> {
        self.inner
            .with_feed(feed_key, |feed| async move { feed.get_timeline(offset, limit).await })
            .await
    }

    /// One message of any feed.
    pub async fn get_message(
        &self,
        feed_key: FeedKey,
        index: u64,
    ) -> Result<TimelineEntry, NodeError> {
        self.inner
            .with_feed(feed_key, |feed| async move { feed.get_message(index).await })
            .await
    }

    /// Stop the loops and close every feed.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(task) = self.self_loop.lock().unwrap().take() {
            task.abort();
        }
        let watchers: Vec<JoinHandle<()>> = {
            let mut map = self.inner.watchers.lock().unwrap();
            map.drain().map(|(_, task)| task).collect()
        };
        for task in watchers {
            task.abort();
        }
        self.inner.registry.close_all().await;
        info!(feed = %self.inner.feed_key, "node stopped");
    }
}
