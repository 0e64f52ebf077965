//! `fjall`-backed [`MetadataStore`]. `fjall` is an embedded, ordered,
//! transactional LSM store in pure Rust — a good fit for the commodity SBC
//! hardware Buddy Blocks targets, and the one engine in the adapter corpus
//! this crate's transaction model was grounded on.

use std::path::Path;

use buddy_core::{MetadataStore, StoreError, Transaction};
use fjall::{Config, PartitionCreateOptions, TxKeyspace, TxPartitionHandle};
use snafu::{ResultExt, Snafu};
use tracing::{error, warn};

#[derive(Debug, Snafu)]
pub enum OpenError {
    #[snafu(display("failed to open fjall keyspace at {path}: {source}"))]
    Keyspace {
        path: String,
        source: fjall::Error,
    },
    #[snafu(display("failed to open fjall partition {name:?}: {source}"))]
    Partition {
        name: String,
        source: fjall::Error,
    },
}

/// The single partition holding all three logical tables (hash, free,
/// temp) — they are distinguished by key prefix, not by separate
/// partitions, per the metadata layout.
pub struct FjallMetadataStore {
    keyspace: TxKeyspace,
    partition: TxPartitionHandle,
}

impl FjallMetadataStore {
    pub fn open(dir: impl AsRef<Path>, partition_name: &str) -> Result<Self, OpenError> {
        let dir = dir.as_ref();
        let keyspace: TxKeyspace = Config::new(dir)
            .open_transactional()
            .inspect_err(|source| error!(path = %dir.display(), %source, "failed to open fjall keyspace"))
            .context(KeyspaceSnafu {
                path: dir.display().to_string(),
            })?;
        let partition = keyspace
            .open_partition(partition_name, PartitionCreateOptions::default())
            .inspect_err(|source| error!(path = %dir.display(), partition_name, %source, "failed to open fjall partition"))
            .context(PartitionSnafu {
                name: partition_name.to_string(),
            })?;
        Ok(Self { keyspace, partition })
    }
}

impl MetadataStore for FjallMetadataStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StoreError> {
        let tx = self.keyspace.write_tx();
        Ok(Box::new(FjallTransaction {
            tx,
            partition: self.partition.clone(),
        }))
    }
}

struct FjallTransaction<'a> {
    tx: fjall::WriteTransaction<'a>,
    partition: TxPartitionHandle,
}

impl Transaction for FjallTransaction<'_> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.tx
            .get(&self.partition, key)
            .map(|maybe| maybe.map(|slice| slice.to_vec()))
            .map_err(StoreError::new)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tx.insert(&self.partition, key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.tx.remove(&self.partition, key);
        Ok(())
    }

    fn seek_ge(&mut self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut iter = self.tx.range(&self.partition, prefix.to_vec()..);
        match iter.next() {
            Some(Ok((key, value))) => Ok(Some((key.to_vec(), value.to_vec()))),
            Some(Err(err)) => Err(StoreError::new(err)),
            None => Ok(None),
        }
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().inspect_err(|source| warn!(%source, "fjall transaction commit failed")).map_err(StoreError::new)
    }

    fn abort(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, FjallMetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallMetadataStore::open(dir.path(), "metadata").unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, store) = open_temp();
        let mut txn = store.begin().unwrap();
        txn.put(b"free_4k_1", b"value").unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        assert_eq!(txn.get(b"free_4k_1").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn delete_removes_key() {
        let (_dir, store) = open_temp();
        let mut txn = store.begin().unwrap();
        txn.put(b"t_4k_1", b"value").unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        txn.delete(b"t_4k_1").unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        assert_eq!(txn.get(b"t_4k_1").unwrap(), None);
    }

    #[test]
    fn seek_ge_finds_smallest_matching_key() {
        let (_dir, store) = open_temp();
        let mut txn = store.begin().unwrap();
        txn.put(b"free_4k_2", b"two").unwrap();
        txn.put(b"free_4k_10", b"ten").unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        let (key, value) = txn.seek_ge(b"free_4k_").unwrap().unwrap();
        // Decimal-ASCII lexicographic order: "free_4k_10" < "free_4k_2".
        assert_eq!(key, b"free_4k_10");
        assert_eq!(value, b"ten");
    }

    #[test]
    fn abort_discards_writes() {
        let (_dir, store) = open_temp();
        let mut txn = store.begin().unwrap();
        txn.put(b"free_4k_1", b"value").unwrap();
        txn.abort().unwrap();

        let mut txn = store.begin().unwrap();
        assert_eq!(txn.get(b"free_4k_1").unwrap(), None);
    }
}
