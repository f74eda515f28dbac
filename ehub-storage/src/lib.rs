//! Embedded persistence for ehub.
//!
//! Every logical log (QoS1 messages, sink offsets, session metadata) lives in its
//! own sled database created through [`StorageFactory`]. A database exposes a
//! default bucket plus any number of named buckets, see [`StorageDB`].

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use parking_lot::Mutex;

mod storage;

pub use storage::{StorageDB, KV};

pub type Result<T> = anyhow::Result<T>;

/// Bucket holding the per-client subscription map
pub const BUCKET_SUBSCRIPTION: &str = ".subscription";
/// Bucket holding retained messages keyed by topic
pub const BUCKET_RETAINED: &str = ".retained";
/// Bucket holding will messages keyed by client id
pub const BUCKET_WILL: &str = ".will";

/// Opens and caches one [`StorageDB`] per file name under a directory.
pub struct StorageFactory {
    dir: PathBuf,
    dbs: Mutex<HashMap<String, StorageDB>>,
}

impl StorageFactory {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| anyhow!("failed to create storage dir {:?}, {}", dir, e))?;
        Ok(Self { dir, dbs: Mutex::new(HashMap::new()) })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the database named `name`, opening it on first use.
    pub fn new_db(&self, name: &str) -> Result<StorageDB> {
        if name.is_empty() {
            return Err(anyhow!("name ({}) invalid", name));
        }
        let mut dbs = self.dbs.lock();
        if let Some(db) = dbs.get(name) {
            return Ok(db.clone());
        }
        let db = StorageDB::open(self.dir.join(name))?;
        dbs.insert(name.to_owned(), db.clone());
        log::debug!("storage {} opened in {:?}", name, self.dir);
        Ok(db)
    }

    /// Flushes every database opened by this factory.
    pub fn close(&self) {
        for (name, db) in self.dbs.lock().iter() {
            if let Err(e) = db.flush() {
                log::warn!("failed to flush storage {}, {:?}", name, e);
            }
        }
    }
}
