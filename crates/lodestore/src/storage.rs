//! RocksDB-backed payload storage.
//!
//! One shared engine serves every collection; each collection gets its own
//! column family keyed by collection name, plus the reserved `__schema__`
//! family holding persisted schemas. Values are MessagePack — the codec
//! round-trips the recursive value model losslessly, which JSON cannot do
//! for timestamps and GUIDs.
//!
//! RocksDB calls are synchronous, so every operation hops onto the
//! blocking pool.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, IteratorMode, MultiThreaded, Options};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Reserved namespace persisting collection schemas.
pub const SCHEMA_NAMESPACE: &str = "__schema__";

type Db = DBWithThreadMode<MultiThreaded>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("RocksDB error: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("unable to decode a stored payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("unable to encode a payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("unknown namespace '{0}'")]
    UnknownNamespace(String),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

type StorageResult<T> = Result<T, StorageError>;

/// Handle to the shared KV engine. Cheap to clone; the underlying engine
/// closes when the last clone drops.
#[derive(Clone)]
pub struct StorageEngine {
    db: Arc<Db>,
}

impl StorageEngine {
    /// Opens the engine at `path`, carrying over every column family that
    /// already exists there.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // On a fresh directory there is nothing to list yet.
        let mut families = Db::list_cf(&opts, path).unwrap_or_default();
        if families.is_empty() {
            families.push("default".to_string());
        }
        if !families.iter().any(|name| name == SCHEMA_NAMESPACE) {
            families.push(SCHEMA_NAMESPACE.to_string());
        }

        let db = Db::open_cf(&opts, path, families)?;
        Ok(StorageEngine { db: Arc::new(db) })
    }

    /// Creates the column family for a namespace if it does not exist.
    pub fn initialize_namespace(&self, name: &str) -> StorageResult<()> {
        if self.db.cf_handle(name).is_none() {
            self.db.create_cf(name, &Options::default())?;
        }
        Ok(())
    }

    /// Drops a namespace and everything in it.
    pub fn drop_namespace(&self, name: &str) -> StorageResult<()> {
        if self.db.cf_handle(name).is_some() {
            self.db.drop_cf(name)?;
        }
        Ok(())
    }

    /// Writes a row unconditionally.
    pub async fn insert<T>(&self, namespace: &str, key: &str, value: &T) -> StorageResult<()>
    where
        T: Serialize,
    {
        let payload = rmp_serde::to_vec_named(value)?;
        let db = self.db.clone();
        let namespace = namespace.to_string();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(&namespace)
                .ok_or_else(|| StorageError::UnknownNamespace(namespace.clone()))?;
            db.put_cf(&cf, key.as_bytes(), payload)?;
            Ok(())
        })
        .await?
    }

    /// Replaces an existing row. Returns the number of rows updated: zero
    /// when the key is absent, in which case nothing is written.
    pub async fn update<T>(&self, namespace: &str, key: &str, value: &T) -> StorageResult<u64>
    where
        T: Serialize,
    {
        let payload = rmp_serde::to_vec_named(value)?;
        let db = self.db.clone();
        let namespace = namespace.to_string();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(&namespace)
                .ok_or_else(|| StorageError::UnknownNamespace(namespace.clone()))?;
            if db.get_pinned_cf(&cf, key.as_bytes())?.is_none() {
                return Ok(0);
            }
            db.put_cf(&cf, key.as_bytes(), payload)?;
            Ok(1)
        })
        .await?
    }

    /// Deletes a row, returning the number of rows removed.
    pub async fn delete(&self, namespace: &str, key: &str) -> StorageResult<u64> {
        let db = self.db.clone();
        let namespace = namespace.to_string();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(&namespace)
                .ok_or_else(|| StorageError::UnknownNamespace(namespace.clone()))?;
            if db.get_pinned_cf(&cf, key.as_bytes())?.is_none() {
                return Ok(0);
            }
            db.delete_cf(&cf, key.as_bytes())?;
            Ok(1)
        })
        .await?
    }

    pub async fn get<T>(&self, namespace: &str, key: &str) -> StorageResult<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let db = self.db.clone();
        let namespace = namespace.to_string();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(&namespace)
                .ok_or_else(|| StorageError::UnknownNamespace(namespace.clone()))?;
            match db.get_pinned_cf(&cf, key.as_bytes())? {
                Some(payload) => Ok(Some(rmp_serde::from_slice(&payload)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    /// Reads every row of a namespace.
    pub async fn get_all<T>(&self, namespace: &str) -> StorageResult<Vec<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let db = self.db.clone();
        let namespace = namespace.to_string();
        tokio::task::spawn_blocking(move || {
            let cf = db
                .cf_handle(&namespace)
                .ok_or_else(|| StorageError::UnknownNamespace(namespace.clone()))?;
            let mut rows = Vec::new();
            for entry in db.iterator_cf(&cf, IteratorMode::Start) {
                let (_key, payload) = entry?;
                rows.push(rmp_serde::from_slice(&payload)?);
            }
            Ok(rows)
        })
        .await?
    }
}
