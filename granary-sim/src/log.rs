//! Shared in-memory logs with live tails.

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use granary_model::{FeedKey, LogError, LogOpener, LogStorage, LogStream, MessageLog};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

const LIVE_BUFFER: usize = 256;
const STREAM_BUFFER: usize = 64;

#[derive(Default)]
pub(crate) struct LogHub {
    feeds: RwLock<HashMap<FeedKey, Arc<SharedLog>>>,
}

impl LogHub {
    fn get_or_create(&self, feed_key: FeedKey) -> Arc<SharedLog> {
        if let Some(log) = self.feeds.read().unwrap().get(&feed_key) {
            return log.clone();
        }
        let mut feeds = self.feeds.write().unwrap();
        feeds
            .entry(feed_key)
            .or_insert_with(|| {
                let (live_tx, _) = broadcast::channel(LIVE_BUFFER);
                Arc::new(SharedLog {
                    entries: RwLock::new(Vec::new()),
                    live_tx,
                    appended: Notify::new(),
                })
            })
            .clone()
    }
}

/// One feed's log, shared by every handle in the hub.
struct SharedLog {
    entries: RwLock<Vec<Vec<u8>>>,
    live_tx: broadcast::Sender<u64>,
    appended: Notify,
}

impl SharedLog {
    fn len(&self) -> u64 {
        self.entries.read().unwrap().len() as u64
    }

    fn push(&self, value: Vec<u8>) -> u64 {
        let mut entries = self.entries.write().unwrap();
        entries.push(value);
        let len = entries.len() as u64;
        drop(entries);
        let _ = self.live_tx.send(len - 1);
        self.appended.notify_waiters();
        len
    }
}

/// Opens handles onto the hub's shared logs.
pub struct SimLogOpener {
    hub: Arc<LogHub>,
}

impl SimLogOpener {
    pub(crate) fn new(hub: Arc<LogHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl LogOpener for SimLogOpener {
    async fn open(
        &self,
        _storage: LogStorage,
        feed_key: FeedKey,
        secret_key: Option<SigningKey>,
        _sparse: bool,
    ) -> Result<Arc<dyn MessageLog>, LogError> {
        let writable = match secret_key {
            Some(key) => {
                if FeedKey::from(key.verifying_key().to_bytes()) != feed_key {
                    return Err(LogError::Io("secret key does not match feed key".into()));
                }
                true
            }
            None => false,
        };
        Ok(Arc::new(SimLog {
            shared: self.hub.get_or_create(feed_key),
            writable,
            closed: CancellationToken::new(),
        }))
    }
}

struct SimLog {
    shared: Arc<SharedLog>,
    writable: bool,
    closed: CancellationToken,
}

#[async_trait]
impl MessageLog for SimLog {
    fn length(&self) -> u64 {
        self.shared.len()
    }

    async fn append(&self, value: Vec<u8>) -> Result<u64, LogError> {
        if self.closed.is_cancelled() {
            return Err(LogError::Closed);
        }
        if !self.writable {
            return Err(LogError::NotWritable);
        }
        Ok(self.shared.push(value))
    }

    async fn get(&self, index: u64) -> Result<Vec<u8>, LogError> {
        self.shared
            .entries
            .read()
            .unwrap()
            .get(index as usize)
            .cloned()
            .ok_or(LogError::NotFound(index))
    }

    async fn update(&self, timeout: Duration) -> Result<(), LogError> {
        let shared = self.shared.clone();
        let wait = async move {
            loop {
                let appended = shared.appended.notified();
                if shared.len() > 0 {
                    return;
                }
                appended.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| LogError::Timeout)
    }

    fn read_stream(&self, start: u64, end: Option<u64>) -> LogStream {
        let shared = self.shared.clone();
        let closed = self.closed.clone();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            // Subscribe before snapshotting so no append falls in a gap.
            let mut live = shared.live_tx.subscribe();
            let mut next = start;
            loop {
                loop {
                    if end.is_some_and(|e| next >= e) {
                        return;
                    }
                    let item = shared.entries.read().unwrap().get(next as usize).cloned();
                    match item {
                        Some(value) => {
                            if tx.send(Ok(value)).await.is_err() {
                                return;
                            }
                            next += 1;
                        }
                        None => break,
                    }
                }
                tokio::select! {
                    _ = closed.cancelled() => return,
                    _ = tx.closed() => return,
                    recv = live.recv() => match recv {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use futures_util::StreamExt;

    fn keypair() -> (SigningKey, FeedKey) {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let key = FeedKey::from(signing.verifying_key().to_bytes());
        (signing, key)
    }

    #[tokio::test]
    async fn test_appends_visible_to_other_handles() {
        let hub = Arc::new(LogHub::default());
        let opener = SimLogOpener::new(hub);
        let (signing, key) = keypair();

        let writer = opener
            .open(LogStorage::Ephemeral, key, Some(signing), false)
            .await
            .unwrap();
        let reader = opener.open(LogStorage::Ephemeral, key, None, true).await.unwrap();

        assert_eq!(writer.append(b"a".to_vec()).await.unwrap(), 1);
        assert_eq!(writer.append(b"b".to_vec()).await.unwrap(), 2);
        assert_eq!(reader.length(), 2);
        assert_eq!(reader.get(1).await.unwrap(), b"b");
        assert_eq!(reader.get(2).await.unwrap_err(), LogError::NotFound(2));
        assert_eq!(reader.append(b"c".to_vec()).await.unwrap_err(), LogError::NotWritable);
    }

    #[tokio::test]
    async fn test_mismatched_secret_key_rejected() {
        let hub = Arc::new(LogHub::default());
        let opener = SimLogOpener::new(hub);
        let (signing, _) = keypair();
        let (_, other_key) = keypair();

        let err = opener
            .open(LogStorage::Ephemeral, other_key, Some(signing), false)
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, LogError::Io(_)));
    }

    #[tokio::test]
    async fn test_live_stream_follows_appends() {
        let hub = Arc::new(LogHub::default());
        let opener = SimLogOpener::new(hub);
        let (signing, key) = keypair();
        let log = opener
            .open(LogStorage::Ephemeral, key, Some(signing), false)
            .await
            .unwrap();

        log.append(b"one".to_vec()).await.unwrap();
        let mut stream = log.read_stream(0, None);
        assert_eq!(stream.next().await.unwrap().unwrap(), b"one");

        log.append(b"two".to_vec()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_bounded_stream_terminates() {
        let hub = Arc::new(LogHub::default());
        let opener = SimLogOpener::new(hub);
        let (signing, key) = keypair();
        let log = opener
            .open(LogStorage::Ephemeral, key, Some(signing), false)
            .await
            .unwrap();
        for i in 0..5u8 {
            log.append(vec![i]).await.unwrap();
        }

        let values: Vec<_> = log.read_stream(1, Some(4)).collect().await;
        let values: Vec<Vec<u8>> = values.into_iter().map(|v| v.unwrap()).collect();
        assert_eq!(values, vec![vec![1], vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn test_update_times_out_on_empty_log() {
        let hub = Arc::new(LogHub::default());
        let opener = SimLogOpener::new(hub);
        let (_, key) = keypair();
        let log = opener.open(LogStorage::Ephemeral, key, None, true).await.unwrap();
        let err = log.update(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, LogError::Timeout);
    }
}
