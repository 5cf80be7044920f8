//! Namespaced byte storage under the state document store
//!
//! Supports in-memory, RocksDB, and Sled backends. Every node of a replica set
//! shares the same backend handle: it stands in for the replicated, majority
//! committed data set.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rocksdb::{ColumnFamilyDescriptor, Options, WriteOptions, DB};

use crate::common::{Error, Result};

/// Namespace holding migration recipient state documents
pub const NS_MIGRATION_RECIPIENTS: &str = "migration_recipients";
/// Namespace holding change stream state documents
pub const NS_CHANGE_STREAM_STATE: &str = "change_stream_state";

pub const NAMESPACES: &[&str] = &[NS_MIGRATION_RECIPIENTS, NS_CHANGE_STREAM_STATE];

/// Trait for document storage backends
pub trait DocumentBackend: Send + Sync {
    fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, ns: &str, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, ns: &str, key: &str) -> Result<()>;
    /// All entries of a namespace, ordered by key
    fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>>;
    fn flush(&self) -> Result<()>;
}

type Namespaces = HashMap<String, BTreeMap<String, Vec<u8>>>;

/// In-memory backend (default for tests)
#[derive(Default)]
pub struct MemBackend {
    namespaces: Mutex<Namespaces>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Namespaces>> {
        self.namespaces
            .lock()
            .map_err(|_| Error::Internal("memory backend lock poisoned".into()))
    }
}

impl DocumentBackend for MemBackend {
    fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(ns).and_then(|m| m.get(key)).cloned())
    }

    fn put(&self, ns: &str, key: &str, value: &[u8]) -> Result<()> {
        self.lock()?
            .entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, ns: &str, key: &str) -> Result<()> {
        if let Some(m) = self.lock()?.get_mut(ns) {
            m.remove(key);
        }
        Ok(())
    }

    fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .lock()?
            .get(ns)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// RocksDB backend, one column family per namespace
pub struct RocksBackend {
    db: DB,
}

impl RocksBackend {
    /// Open or create the document store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = NAMESPACES
            .iter()
            .map(|ns| ColumnFamilyDescriptor::new(*ns, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self { db })
    }

    fn cf(&self, ns: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(ns)
            .ok_or_else(|| Error::NotFound(format!("namespace {}", ns)))
    }

    fn sync_writes() -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        write_opts
    }
}

impl DocumentBackend for RocksBackend {
    fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf(ns)?, key.as_bytes())?)
    }

    fn put(&self, ns: &str, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .put_cf_opt(self.cf(ns)?, key.as_bytes(), value, &Self::sync_writes())?;
        Ok(())
    }

    fn delete(&self, ns: &str, key: &str) -> Result<()> {
        self.db
            .delete_cf_opt(self.cf(ns)?, key.as_bytes(), &Self::sync_writes())?;
        Ok(())
    }

    fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let iter = self
            .db
            .iterator_cf(self.cf(ns)?, rocksdb::IteratorMode::Start);

        let mut entries = Vec::new();
        for item in iter {
            let (key_bytes, value_bytes) = item?;
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| Error::DocumentCorrupted("Invalid UTF-8 key".into()))?;
            entries.push((key, value_bytes.to_vec()));
        }

        Ok(entries)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Sled backend, one tree per namespace
#[cfg(feature = "sled-backend")]
pub struct SledBackend {
    db: sled::Db,
}

#[cfg(feature = "sled-backend")]
impl SledBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }
}

#[cfg(feature = "sled-backend")]
impl DocumentBackend for SledBackend {
    fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.open_tree(ns)?.get(key)?.map(|ivec| ivec.to_vec()))
    }

    fn put(&self, ns: &str, key: &str, value: &[u8]) -> Result<()> {
        let tree = self.db.open_tree(ns)?;
        tree.insert(key, value)?;
        tree.flush()?;
        Ok(())
    }

    fn delete(&self, ns: &str, key: &str) -> Result<()> {
        let tree = self.db.open_tree(ns)?;
        tree.remove(key)?;
        tree.flush()?;
        Ok(())
    }

    fn scan(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self.db.open_tree(ns)?.iter() {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|_| Error::DocumentCorrupted("Invalid UTF-8 key".into()))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Open the backend selected by configuration
pub fn open_backend(
    kind: crate::common::config::BackendKind,
    path: impl AsRef<Path>,
) -> Result<Arc<dyn DocumentBackend>> {
    use crate::common::config::BackendKind;
    match kind {
        BackendKind::Memory => Ok(Arc::new(MemBackend::new())),
        BackendKind::Rocksdb => Ok(Arc::new(RocksBackend::open(path)?)),
        #[cfg(feature = "sled-backend")]
        BackendKind::Sled => Ok(Arc::new(SledBackend::open(path)?)),
        #[cfg(not(feature = "sled-backend"))]
        BackendKind::Sled => Err(Error::InvalidConfig(
            "sled backend requires the `sled-backend` feature".into(),
        )),
    }
}
