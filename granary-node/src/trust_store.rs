//! TrustStore - persisted trust links in trust.db
//!
//! Table:
//! - links: `root(32) || grantee(32)` → raw signed link bytes
//!
//! The orchestrator writes a link here whenever it installs one into the
//! overlay, and replays the table into the overlay at startup so trust
//! survives restarts.

use granary_model::{FeedKey, FEED_KEY_SIZE};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use thiserror::Error;

const LINKS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("links");

#[derive(Error, Debug)]
pub enum TrustStoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
}

pub struct TrustStore {
    db: Database,
}

impl TrustStore {
    /// Open or create trust.db at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrustStoreError> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(LINKS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Persist a link issued by `root` for `grantee`. Re-installing
    /// overwrites the previous link for the same pair.
    pub fn install(
        &self,
        root: &FeedKey,
        grantee: &FeedKey,
        link: &[u8],
    ) -> Result<(), TrustStoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LINKS_TABLE)?;
            table.insert(pair_key(root, grantee).as_slice(), link)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// The stored link from `root` to `grantee`, if any.
    pub fn lookup(
        &self,
        root: &FeedKey,
        grantee: &FeedKey,
    ) -> Result<Option<Vec<u8>>, TrustStoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LINKS_TABLE)?;
        Ok(table.get(pair_key(root, grantee).as_slice())?.map(|v| v.value().to_vec()))
    }

    /// All stored links issued by `root`.
    pub fn links_for(&self, root: &FeedKey) -> Result<Vec<Vec<u8>>, TrustStoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LINKS_TABLE)?;

        let start = pair_key(root, &FeedKey([0x00; FEED_KEY_SIZE]));
        let end = pair_key(root, &FeedKey([0xff; FEED_KEY_SIZE]));
        let mut links = Vec::new();
        for result in table.range(start.as_slice()..=end.as_slice())? {
            let (_, value) = result?;
            links.push(value.value().to_vec());
        }
        Ok(links)
    }

    /// Every stored link with its root, for startup replay.
    pub fn all(&self) -> Result<Vec<(FeedKey, Vec<u8>)>, TrustStoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LINKS_TABLE)?;

        let mut links = Vec::new();
        for result in table.iter()? {
            let (key, value) = result?;
            let Ok(root) = FeedKey::try_from(&key.value()[..FEED_KEY_SIZE]) else {
                continue;
            };
            links.push((root, value.value().to_vec()));
        }
        Ok(links)
    }
}

fn pair_key(root: &FeedKey, grantee: &FeedKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(FEED_KEY_SIZE * 2);
    key.extend_from_slice(root.as_bytes());
    key.extend_from_slice(grantee.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_and_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TrustStore::open(tmp.path().join("trust.db")).unwrap();

        let root = FeedKey([1; 32]);
        let grantee = FeedKey([2; 32]);
        assert!(store.lookup(&root, &grantee).unwrap().is_none());

        store.install(&root, &grantee, b"link-bytes").unwrap();
        assert_eq!(store.lookup(&root, &grantee).unwrap().as_deref(), Some(&b"link-bytes"[..]));

        // Overwrite for the same pair.
        store.install(&root, &grantee, b"fresh").unwrap();
        assert_eq!(store.lookup(&root, &grantee).unwrap().as_deref(), Some(&b"fresh"[..]));
    }

    #[test]
    fn test_links_for_scopes_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TrustStore::open(tmp.path().join("trust.db")).unwrap();

        let root_a = FeedKey([1; 32]);
        let root_b = FeedKey([9; 32]);
        store.install(&root_a, &FeedKey([2; 32]), b"a2").unwrap();
        store.install(&root_a, &FeedKey([3; 32]), b"a3").unwrap();
        store.install(&root_b, &FeedKey([2; 32]), b"b2").unwrap();

        let links = store.links_for(&root_a).unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.contains(&b"a2".to_vec()));
        assert!(links.contains(&b"a3".to_vec()));
        assert_eq!(store.all().unwrap().len(), 3);
    }

    #[test]
    fn test_links_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trust.db");
        let root = FeedKey([1; 32]);
        {
            let store = TrustStore::open(&path).unwrap();
            store.install(&root, &FeedKey([2; 32]), b"persisted").unwrap();
        }
        let store = TrustStore::open(&path).unwrap();
        assert_eq!(store.links_for(&root).unwrap(), vec![b"persisted".to_vec()]);
    }
}
