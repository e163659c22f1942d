//! FeedRegistry - opened feed handles by key
//!
//! Holds the node's long-lived feeds: its own plus every followed feed.
//! Scoped ephemeral feeds never enter the registry.

use granary_feed::Feed;
use granary_model::FeedKey;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct FeedRegistry {
    feeds: RwLock<HashMap<FeedKey, Feed>>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, feed_key: FeedKey, feed: Feed) {
        self.feeds.write().unwrap().insert(feed_key, feed);
    }

    pub fn remove(&self, feed_key: &FeedKey) -> Option<Feed> {
        self.feeds.write().unwrap().remove(feed_key)
    }

    pub fn get(&self, feed_key: &FeedKey) -> Option<Feed> {
        self.feeds.read().unwrap().get(feed_key).cloned()
    }

    pub fn contains(&self, feed_key: &FeedKey) -> bool {
        self.feeds.read().unwrap().contains_key(feed_key)
    }

    pub fn keys(&self) -> Vec<FeedKey> {
        self.feeds.read().unwrap().keys().copied().collect()
    }

    /// Drain the registry and close every feed.
    pub async fn close_all(&self) {
        let feeds: Vec<Feed> = {
            let mut map = self.feeds.write().unwrap();
            map.drain().map(|(_, feed)| feed).collect()
        };
        for feed in feeds {
            feed.close().await;
        }
    }
}
