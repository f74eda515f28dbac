use std::collections::HashMap;
use std::path::Path;

use anyhow::anyhow;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};

use ehub_utils::{bytes_to_u64, timestamp_secs, u64_to_bytes, u64u64_to_bytes};

use super::Result;

const SELF_BUCKET: &str = ".self";
const META_BUCKET: &str = ".meta";
const SEQUENCE_KEY: &[u8] = b"sequence";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KV {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// One embedded database.
///
/// The default bucket doubles as an append log: [`StorageDB::batch_put_v`] keys each
/// value with `sequence (8 bytes BE) ++ unix seconds (8 bytes BE)`, so a cursor scan
/// from the first key walks the log oldest first. The sequence counter is kept in a
/// separate meta bucket and advanced in the same transaction as the appended values.
///
/// All reads copy the returned bytes out of the store.
#[derive(Clone)]
pub struct StorageDB {
    db: sled::Db,
    tree: sled::Tree,
    meta: sled::Tree,
}

impl StorageDB {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::Config::default().path(path.as_ref()).mode(sled::Mode::HighThroughput).open()?;
        let tree = db.open_tree(SELF_BUCKET)?;
        let meta = db.open_tree(META_BUCKET)?;
        Ok(Self { db, tree, meta })
    }

    /// Returns the last sequence id assigned by `batch_put_v`, 0 if none.
    #[inline]
    pub fn sequence(&self) -> Result<u64> {
        Ok(self.meta.get(SEQUENCE_KEY)?.map(|v| bytes_to_u64(&v)).unwrap_or_default())
    }

    #[inline]
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    #[inline]
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    #[inline]
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    /// Writes all pairs into the default bucket atomically.
    pub fn batch_put(&self, kvs: Vec<KV>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for kv in kvs {
            batch.insert(kv.key, kv.value);
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    /// Appends values to the log, returning the sequence id given to the last one.
    pub fn batch_put_v<V: AsRef<[u8]>>(&self, vs: &[V]) -> Result<u64> {
        let ts = timestamp_secs();
        let res: std::result::Result<u64, TransactionError<sled::Error>> =
            (&self.tree, &self.meta).transaction(|(tree, meta)| {
                let mut sid = meta.get(SEQUENCE_KEY)?.map(|v| bytes_to_u64(&v)).unwrap_or_default();
                for v in vs {
                    sid += 1;
                    tree.insert(&u64u64_to_bytes(sid, ts)[..], v.as_ref())?;
                }
                meta.insert(SEQUENCE_KEY, &u64_to_bytes(sid)[..])?;
                Ok::<u64, ConflictableTransactionError<sled::Error>>(sid)
            });
        res.map_err(|e| anyhow!("failed to append {} value(s), {:?}", vs.len(), e))
    }

    /// Returns up to `size` pairs starting at the first key not less than `offset`.
    pub fn batch_fetch(&self, offset: &[u8], size: usize) -> Result<Vec<KV>> {
        let mut res = Vec::with_capacity(size.min(1024));
        for item in self.tree.range(offset..).take(size) {
            let (k, v) = item?;
            res.push(KV { key: k.to_vec(), value: v.to_vec() });
        }
        Ok(res)
    }

    /// Deletes log entries whose embedded timestamp is before `timestamp`,
    /// scanning from the oldest entry and stopping at the first newer one.
    pub fn clean(&self, timestamp: u64) -> Result<u64> {
        let mut batch = sled::Batch::default();
        let mut count = 0;
        for item in self.tree.iter() {
            let (k, _) = item?;
            if k.len() < 16 || bytes_to_u64(&k[8..16]) >= timestamp {
                break;
            }
            batch.remove(k);
            count += 1;
        }
        if count > 0 {
            self.tree.apply_batch(batch)?;
        }
        Ok(count)
    }

    #[inline]
    pub fn bucket_put(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.open_tree(bucket)?.insert(key, value)?;
        Ok(())
    }

    #[inline]
    pub fn bucket_get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.open_tree(bucket)?.get(key)?.map(|v| v.to_vec()))
    }

    #[inline]
    pub fn bucket_delete(&self, bucket: &str, key: &[u8]) -> Result<()> {
        self.db.open_tree(bucket)?.remove(key)?;
        Ok(())
    }

    pub fn bucket_list(&self, bucket: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut res = HashMap::new();
        for item in self.db.open_tree(bucket)?.iter() {
            match item {
                Ok((k, v)) => {
                    res.insert(String::from_utf8_lossy(&k).into_owned(), v.to_vec());
                }
                Err(e) => {
                    log::warn!("{:?}", e);
                }
            }
        }
        Ok(res)
    }

    /// Number of entries in the default bucket.
    #[inline]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    #[inline]
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
