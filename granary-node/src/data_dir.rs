//! Data directory management
//!
//! Layout of a node's storage:
//! - `identity.key` — Ed25519 private key
//! - `feeds/{feed key hex}/` — durable log storage per fully replicated feed
//! - `overlay/` — overlay storage root
//! - `overlay/trust.db` — persisted trust links

use granary_model::FeedKey;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DataDir {
    base: PathBuf,
}

impl DataDir {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path to the identity key file.
    pub fn identity_key(&self) -> PathBuf {
        self.base.join("identity.key")
    }

    /// Root of per-feed durable log storage.
    pub fn feeds_dir(&self) -> PathBuf {
        self.base.join("feeds")
    }

    /// Storage directory for one feed's log.
    pub fn feed_dir(&self, feed_key: &FeedKey) -> PathBuf {
        self.feeds_dir().join(hex::encode(feed_key.as_bytes()))
    }

    /// Overlay storage root.
    pub fn overlay_dir(&self) -> PathBuf {
        self.base.join("overlay")
    }

    /// Path to the trust link database.
    pub fn trust_db(&self) -> PathBuf {
        self.overlay_dir().join("trust.db")
    }

    /// Ensure the base layout exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.feeds_dir())?;
        std::fs::create_dir_all(self.overlay_dir())?;
        Ok(())
    }

    /// Ensure one feed's storage directory exists, returning its path.
    pub fn ensure_feed_dir(&self, feed_key: &FeedKey) -> std::io::Result<PathBuf> {
        let dir = self.feed_dir(feed_key);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let dd = DataDir::new("/data");
        assert_eq!(dd.base(), Path::new("/data"));
        assert_eq!(dd.identity_key(), PathBuf::from("/data/identity.key"));
        assert_eq!(dd.feeds_dir(), PathBuf::from("/data/feeds"));
        assert_eq!(dd.trust_db(), PathBuf::from("/data/overlay/trust.db"));
    }

    #[test]
    fn test_feed_dir_is_hex_of_key() {
        let dd = DataDir::new("/data");
        let key = FeedKey([0xab; 32]);
        assert_eq!(dd.feed_dir(&key), PathBuf::from(format!("/data/feeds/{}", "ab".repeat(32))));
    }

    #[test]
    fn test_ensure_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join("node"));
        dd.ensure_dirs().unwrap();
        assert!(dd.feeds_dir().is_dir());
        assert!(dd.overlay_dir().is_dir());

        let key = FeedKey([1; 32]);
        let feed_dir = dd.ensure_feed_dir(&key).unwrap();
        assert!(feed_dir.is_dir());
    }
}
