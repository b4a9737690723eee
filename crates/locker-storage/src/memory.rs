//! In-memory storage backend.
//!
//! Records live in a `BTreeMap` behind a `RwLock` and are lost when the
//! process exits. Used by the test suites and by `memory://` tenant
//! databases in local development.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{Record, StorageBackend, StorageError};

/// An in-memory storage backend backed by a sorted map.
///
/// Clones share the same underlying map.
///
/// # Examples
///
/// ```
/// # use locker_storage::{MemoryBackend, StorageBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// backend.put("users/42", b"{}").await.unwrap();
/// assert!(backend.exists("users/42").await.unwrap());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether the backend holds no records.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.data
            .write()
            .await
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<Record>, StorageError> {
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.read().await.contains_key(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("users/nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites_previous_value() {
        let backend = MemoryBackend::new();
        backend.put("users/1", b"v1").await.unwrap();
        backend.put("users/1", b"v2").await.unwrap();
        assert_eq!(backend.get("users/1").await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.put("folders/u/f", b"x").await.unwrap();
        backend.delete("folders/u/f").await.unwrap();
        backend.delete("folders/u/f").await.unwrap();
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn list_stops_at_prefix_boundary() {
        let backend = MemoryBackend::new();
        backend.put("teams/a/members/1", b"1").await.unwrap();
        backend.put("teams/a/members/2", b"2").await.unwrap();
        backend.put("teams/a/policies/x", b"3").await.unwrap();
        backend.put("teams/b/members/1", b"4").await.unwrap();

        let keys = backend.list("teams/a/members/").await.unwrap();
        assert_eq!(keys, vec!["teams/a/members/1", "teams/a/members/2"]);
    }

    #[tokio::test]
    async fn scan_returns_values_in_key_order() {
        let backend = MemoryBackend::new();
        backend.put("ciphers/b", b"second").await.unwrap();
        backend.put("ciphers/a", b"first").await.unwrap();
        backend.put("folders/a", b"other").await.unwrap();

        let records = backend.scan("ciphers/").await.unwrap();
        assert_eq!(
            records,
            vec![
                ("ciphers/a".to_owned(), b"first".to_vec()),
                ("ciphers/b".to_owned(), b"second".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn clones_share_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put("relay/aliases/1", b"a").await.unwrap();
        assert!(clone.exists("relay/aliases/1").await.unwrap());
    }
}
