//! `RocksDB` storage backend for single-node deployments.
//!
//! `RocksDB` is synchronous, so every call is moved onto the Tokio blocking
//! pool through [`RocksDbBackend::blocking`]. Prefix reads walk the sorted
//! keyspace forward from the prefix and stop at the first key outside it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};

use crate::{Record, StorageBackend, StorageError};

type Db = DBWithThreadMode<MultiThreaded>;

/// A storage backend backed by an embedded `RocksDB` database.
///
/// # Examples
///
/// ```no_run
/// # use locker_storage::RocksDbBackend;
/// let backend = RocksDbBackend::open("/var/lib/locker/default").unwrap();
/// ```
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open (or create) a database directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` cannot open the path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Db::open(&opts, path).map_err(|e| StorageError::Open {
            target: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Filesystem path of this database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure against the database on the blocking pool.
    ///
    /// `on_join` builds the error reported if the blocking task itself dies.
    async fn blocking<T, F>(
        &self,
        op: F,
        on_join: impl FnOnce(String) -> StorageError,
    ) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Db) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| on_join(format!("blocking task failed: {e}")))?
    }
}

/// Collect every entry whose key starts with `prefix`.
fn read_range(db: &Db, prefix: &str, with_values: bool) -> Result<Vec<Record>, StorageError> {
    let mut out = Vec::new();
    for item in db.iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward)) {
        let (k, v) = item.map_err(|e| StorageError::List {
            prefix: prefix.to_owned(),
            reason: e.to_string(),
        })?;
        let key = String::from_utf8(k.to_vec()).map_err(|e| StorageError::InvalidKey {
            reason: e.to_string(),
        })?;
        if !key.starts_with(prefix) {
            break;
        }
        let value = if with_values { v.to_vec() } else { Vec::new() };
        out.push((key, value));
    }
    Ok(out)
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let owned = key.to_owned();
        let for_join = key.to_owned();
        self.blocking(
            move |db| {
                db.get(owned.as_bytes()).map_err(|e| StorageError::Read {
                    key: owned,
                    reason: e.to_string(),
                })
            },
            |reason| StorageError::Read { key: for_join, reason },
        )
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let owned = key.to_owned();
        let for_join = key.to_owned();
        let value = value.to_vec();
        self.blocking(
            move |db| {
                db.put(owned.as_bytes(), &value)
                    .map_err(|e| StorageError::Write {
                        key: owned,
                        reason: e.to_string(),
                    })
            },
            |reason| StorageError::Write { key: for_join, reason },
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let owned = key.to_owned();
        let for_join = key.to_owned();
        self.blocking(
            move |db| {
                db.delete(owned.as_bytes())
                    .map_err(|e| StorageError::Delete {
                        key: owned,
                        reason: e.to_string(),
                    })
            },
            |reason| StorageError::Delete { key: for_join, reason },
        )
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let owned = prefix.to_owned();
        let for_join = prefix.to_owned();
        let records = self
            .blocking(
                move |db| read_range(db, &owned, false),
                |reason| StorageError::List { prefix: for_join, reason },
            )
            .await?;
        Ok(records.into_iter().map(|(k, _)| k).collect())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<Record>, StorageError> {
        let owned = prefix.to_owned();
        let for_join = prefix.to_owned();
        self.blocking(
            move |db| read_range(db, &owned, true),
            |reason| StorageError::List { prefix: for_join, reason },
        )
        .await
    }
}
