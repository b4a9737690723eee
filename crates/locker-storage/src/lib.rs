//! Storage backend abstraction for Locker.
//!
//! This crate defines the [`StorageBackend`] trait, a record store keyed by
//! `/`-separated paths that knows nothing about users, vaults, or teams. The
//! encryption barrier in `locker-core` wraps a backend so that every value is
//! encrypted before it reaches this layer.
//!
//! Each tenant database alias owns one backend instance. Three
//! implementations are provided:
//!
//! - [`PostgresBackend`]: SaaS default, one `locker_records` table per database (feature `postgres-backend`)
//! - [`RocksDbBackend`]: embedded single-node deployments (feature `rocksdb-backend`)
//! - [`MemoryBackend`]: in-memory, for tests and local development

mod error;
mod memory;
#[cfg(feature = "postgres-backend")]
mod postgres_backend;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "postgres-backend")]
pub use postgres_backend::PostgresBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// A key/value pair returned by [`StorageBackend::scan`].
pub type Record = (String, Vec<u8>);

/// A pluggable record storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `users/<id>`,
/// `teams/<team>/members/<user>`). Values are opaque byte arrays, always
/// encrypted by the barrier before reaching storage.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Deleting a non-existent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Return every key/value pair under a prefix, in key order.
    ///
    /// The default implementation lists keys and fetches each value; keys
    /// deleted between the two steps are skipped. Backends that can read a
    /// range in one pass should override it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] or [`StorageError::Read`] if the
    /// underlying backend fails.
    async fn scan(&self, prefix: &str) -> Result<Vec<Record>, StorageError> {
        let keys = self.list(prefix).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key).await? {
                records.push((key, value));
            }
        }
        Ok(records)
    }

    /// Check whether a key exists in storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
