//! Trust-gated in-memory overlay regions.

use async_trait::async_trait;
use granary_model::trust::unix_now;
use granary_model::{FeedKey, Overlay, OverlayError, OverlayNode, OverlayWatcher, TrustLink};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

const WATCH_BUFFER: usize = 64;

#[derive(Default)]
pub(crate) struct OverlayHub {
    regions: RwLock<HashMap<FeedKey, Arc<Region>>>,
    /// Raw signed links, keyed by the root (issuer) feed.
    links: RwLock<HashMap<FeedKey, Vec<Vec<u8>>>>,
}

impl OverlayHub {
    fn get_or_create(&self, feed_key: FeedKey) -> Arc<Region> {
        if let Some(region) = self.regions.read().unwrap().get(&feed_key) {
            return region.clone();
        }
        self.regions
            .write()
            .unwrap()
            .entry(feed_key)
            .or_insert_with(|| Arc::new(Region::default()))
            .clone()
    }

    /// Whether `identity` holds a currently valid link issued by `root`.
    fn is_trusted(&self, root: &FeedKey, identity: &FeedKey) -> bool {
        if root == identity {
            return true;
        }
        let now = unix_now();
        let links = self.links.read().unwrap();
        links
            .get(root)
            .into_iter()
            .flatten()
            .any(|raw| match TrustLink::verify(root, raw, now) {
                Ok(link) => link.grantee == *identity,
                Err(_) => false,
            })
    }
}

/// One feed's overlay region: ordered entries, watchers, membership.
#[derive(Default)]
struct Region {
    entries: RwLock<BTreeSet<Vec<u8>>>,
    watchers: Mutex<HashMap<u64, WatcherReg>>,
    members: RwLock<HashSet<FeedKey>>,
    membership_changed: Notify,
    next_watcher_id: AtomicU64,
}

struct WatcherReg {
    start: Vec<u8>,
    end: Option<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl Region {
    fn peer_count_excluding(&self, identity: &FeedKey) -> usize {
        self.members.read().unwrap().iter().filter(|m| *m != identity).count()
    }
}

/// One identity's view of the overlay hub.
pub struct SimOverlay {
    hub: Arc<OverlayHub>,
    identity: FeedKey,
}

impl SimOverlay {
    pub(crate) fn new(hub: Arc<OverlayHub>, identity: FeedKey) -> Self {
        Self { hub, identity }
    }
}

#[async_trait]
impl Overlay for SimOverlay {
    async fn join(
        &self,
        feed_key: FeedKey,
        _full: bool,
    ) -> Result<Arc<dyn OverlayNode>, OverlayError> {
        if !self.hub.is_trusted(&feed_key, &self.identity) {
            return Err(OverlayError::Untrusted);
        }
        let region = self.hub.get_or_create(feed_key);
        region.members.write().unwrap().insert(self.identity);
        region.membership_changed.notify_waiters();
        debug!(feed = %feed_key, identity = %self.identity, "joined overlay region");
        Ok(Arc::new(SimOverlayNode { region, identity: self.identity }))
    }

    async fn leave(&self, feed_key: &FeedKey) {
        let region = {
            let regions = self.hub.regions.read().unwrap();
            regions.get(feed_key).cloned()
        };
        if let Some(region) = region {
            region.members.write().unwrap().remove(&self.identity);
            region.membership_changed.notify_waiters();
        }
    }

    async fn add_link(&self, root: FeedKey, link: &[u8]) -> Result<(), OverlayError> {
        // A link that does not verify against the root proves nothing.
        TrustLink::verify(&root, link, unix_now()).map_err(|e| {
            debug!(root = %root, error = %e, "rejected trust link");
            OverlayError::Untrusted
        })?;
        let mut links = self.hub.links.write().unwrap();
        let slot = links.entry(root).or_default();
        if !slot.iter().any(|existing| existing == link) {
            slot.push(link.to_vec());
        }
        Ok(())
    }
}

struct SimOverlayNode {
    region: Arc<Region>,
    identity: FeedKey,
}

impl SimOverlayNode {
    fn in_range(entry: &[u8], start: &[u8], end: Option<&Vec<u8>>) -> bool {
        entry >= start && end.map_or(true, |e| entry < e.as_slice())
    }
}

#[async_trait]
impl OverlayNode for SimOverlayNode {
    async fn insert(
        &self,
        entry: Vec<u8>,
        min_peers: usize,
        timeout: Duration,
    ) -> Result<(), OverlayError> {
        if min_peers > 0 {
            let region = self.region.clone();
            let identity = self.identity;
            let wait = async move {
                loop {
                    let changed = region.membership_changed.notified();
                    if region.peer_count_excluding(&identity) >= min_peers {
                        return;
                    }
                    changed.await;
                }
            };
            tokio::time::timeout(timeout, wait).await.map_err(|_| OverlayError::Timeout)?;
        }

        self.region.entries.write().unwrap().insert(entry.clone());

        // Collect matching watcher senders outside the lock before sending.
        let matching: Vec<mpsc::Sender<Vec<u8>>> = {
            let watchers = self.region.watchers.lock().unwrap();
            watchers
                .values()
                .filter(|reg| Self::in_range(&entry, &reg.start, reg.end.as_ref()))
                .map(|reg| reg.tx.clone())
                .collect()
        };
        for tx in matching {
            let _ = tx.send(entry.clone()).await;
        }
        Ok(())
    }

    async fn request(&self, start: &[u8], end: &[u8]) -> Result<Vec<Vec<u8>>, OverlayError> {
        let entries = self.region.entries.read().unwrap();
        Ok(entries
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .cloned()
            .collect())
    }

    async fn watch(
        &self,
        start: Vec<u8>,
        end: Option<Vec<u8>>,
    ) -> Result<OverlayWatcher, OverlayError> {
        let id = self.region.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.region.watchers.lock().unwrap().insert(id, WatcherReg { start, end, tx });
        Ok(OverlayWatcher { id, rx })
    }

    async fn unwatch(&self, watcher: OverlayWatcher) {
        self.region.watchers.lock().unwrap().remove(&watcher.id);
    }

    async fn peer_count(&self) -> usize {
        self.region.peer_count_excluding(&self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use granary_model::FeedIdentity;

    fn identity() -> (FeedIdentity, FeedKey) {
        let id = FeedIdentity::generate();
        let key = id.feed_key();
        (id, key)
    }

    #[tokio::test]
    async fn test_owner_joins_without_links() {
        let hub = Arc::new(OverlayHub::default());
        let (_, key) = identity();
        let overlay = SimOverlay::new(hub, key);
        assert!(overlay.join(key, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_join_requires_valid_link() {
        let hub = Arc::new(OverlayHub::default());
        let (owner, owner_key) = identity();
        let (_, visitor_key) = identity();
        let visitor = SimOverlay::new(hub.clone(), visitor_key);

        assert_eq!(overlay_err(visitor.join(owner_key, false).await), OverlayError::Untrusted);

        let link = TrustLink::issue(&owner, visitor_key, unix_now() + 3600);
        visitor.add_link(owner_key, &link).await.unwrap();
        assert!(visitor.join(owner_key, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_link_does_not_grant_access() {
        let hub = Arc::new(OverlayHub::default());
        let (owner, owner_key) = identity();
        let (_, visitor_key) = identity();
        let visitor = SimOverlay::new(hub, visitor_key);

        let link = TrustLink::issue(&owner, visitor_key, 1);
        assert_eq!(overlay_err(visitor.add_link(owner_key, &link).await), OverlayError::Untrusted);
        assert_eq!(overlay_err(visitor.join(owner_key, false).await), OverlayError::Untrusted);
    }

    #[tokio::test]
    async fn test_tampered_link_rejected() {
        let hub = Arc::new(OverlayHub::default());
        let (owner, owner_key) = identity();
        let (_, visitor_key) = identity();
        let visitor = SimOverlay::new(hub, visitor_key);

        let mut link = TrustLink::issue(&owner, visitor_key, unix_now() + 3600);
        link[40] ^= 1;
        assert_eq!(overlay_err(visitor.add_link(owner_key, &link).await), OverlayError::Untrusted);
    }

    #[tokio::test]
    async fn test_request_returns_sorted_range() {
        let hub = Arc::new(OverlayHub::default());
        let (_, key) = identity();
        let overlay = SimOverlay::new(hub, key);
        let node = overlay.join(key, true).await.unwrap();

        for raw in [vec![3u8], vec![1], vec![2], vec![9]] {
            node.insert(raw, 0, Duration::from_secs(1)).await.unwrap();
        }
        let got = node.request(&[1], &[9]).await.unwrap();
        assert_eq!(got, vec![vec![1u8], vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn test_watch_sees_inserts_in_range() {
        let hub = Arc::new(OverlayHub::default());
        let (_, key) = identity();
        let overlay = SimOverlay::new(hub, key);
        let node = overlay.join(key, true).await.unwrap();

        let mut watcher = node.watch(vec![2], Some(vec![5])).await.unwrap();
        node.insert(vec![1], 0, Duration::from_secs(1)).await.unwrap();
        node.insert(vec![3], 0, Duration::from_secs(1)).await.unwrap();
        node.insert(vec![7], 0, Duration::from_secs(1)).await.unwrap();

        assert_eq!(watcher.rx.recv().await.unwrap(), vec![3u8]);
        assert!(watcher.rx.try_recv().is_err());
        node.unwatch(watcher).await;
    }

    #[tokio::test]
    async fn test_insert_waits_for_peers() {
        let hub = Arc::new(OverlayHub::default());
        let (owner, owner_key) = identity();
        let (_, visitor_key) = identity();

        let owner_view = SimOverlay::new(hub.clone(), owner_key);
        let visitor_view = SimOverlay::new(hub.clone(), visitor_key);
        let link = TrustLink::issue(&owner, visitor_key, unix_now() + 3600);
        visitor_view.add_link(owner_key, &link).await.unwrap();
        let visitor_node = visitor_view.join(owner_key, false).await.unwrap();

        // No other member yet: a peer-gated insert times out.
        let err = visitor_node.insert(vec![1], 1, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, OverlayError::Timeout);

        let _owner_node = owner_view.join(owner_key, true).await.unwrap();
        visitor_node.insert(vec![1], 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(visitor_node.peer_count().await, 1);
    }

    fn overlay_err<T>(res: Result<T, OverlayError>) -> OverlayError {
        match res {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        }
    }
}
