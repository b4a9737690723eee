//! Encryption-at-rest barrier.
//!
//! Every record written by Locker passes through the barrier: values are
//! serialised to JSON, encrypted with the tenant's data key, then handed to
//! the storage backend. Keys (record paths) stay in plaintext so prefix
//! listing works; paths never embed e-mail addresses, only blind indexes.

use std::fmt;
use std::sync::Arc;

use locker_storage::StorageBackend;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::crypto::{self, EncryptionKey};
use crate::error::BarrierError;

/// Encrypting wrapper around one tenant's storage backend.
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    data_key: EncryptionKey,
    index_key: EncryptionKey,
}

impl Barrier {
    /// Wrap a backend with the tenant's key.
    ///
    /// Separate sub-keys are derived for record encryption and for blind
    /// indexes.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Crypto`] if key derivation fails.
    pub fn new(storage: Arc<dyn StorageBackend>, key: &EncryptionKey) -> Result<Self, BarrierError> {
        Ok(Self {
            storage,
            data_key: crypto::derive_key(key, "locker-records")?,
            index_key: crypto::derive_key(key, "locker-blind-index")?,
        })
    }

    /// Read and decrypt raw bytes.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Crypto`] if decryption fails.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        match self.storage.get(key).await? {
            None => Ok(None),
            Some(ciphertext) => Ok(Some(crypto::decrypt(&self.data_key, &ciphertext)?)),
        }
    }

    /// Encrypt and write raw bytes.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the backend fails.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let ciphertext = crypto::encrypt(&self.data_key, value)?;
        self.storage.put(key, &ciphertext).await?;
        Ok(())
    }

    /// Delete a record. Deleting a missing record is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List record paths under a prefix.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        Ok(self.storage.list(prefix).await?)
    }

    /// Check whether a record exists.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the backend fails.
    pub async fn exists(&self, key: &str) -> Result<bool, BarrierError> {
        Ok(self.storage.exists(key).await?)
    }

    /// Read a JSON record.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Codec`] if the record does not deserialize
    /// into `T`, or any error from [`get`](Barrier::get).
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BarrierError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(bytes) => decode(key, &bytes).map(Some),
        }
    }

    /// Write a JSON record.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Codec`] if `value` cannot be serialized, or
    /// any error from [`put`](Barrier::put).
    pub async fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), BarrierError> {
        let bytes = serde_json::to_vec(value).map_err(|e| BarrierError::Codec {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;
        self.put(key, &bytes).await
    }

    /// Read every JSON record under a prefix, with its path.
    ///
    /// # Errors
    ///
    /// Fails on the first record that cannot be decrypted or decoded.
    pub async fn scan_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>, BarrierError> {
        let records = self.storage.scan(prefix).await?;
        let mut out = Vec::with_capacity(records.len());
        for (key, ciphertext) in records {
            let plaintext = crypto::decrypt(&self.data_key, &ciphertext)?;
            let value = decode(&key, &plaintext)?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Read every JSON record under a prefix, discarding paths.
    ///
    /// # Errors
    ///
    /// Same as [`scan_json`](Barrier::scan_json).
    pub async fn values_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, BarrierError> {
        Ok(self
            .scan_json(prefix)
            .await?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// Delete every record under a prefix, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the backend fails.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, BarrierError> {
        let keys = self.storage.list(prefix).await?;
        for key in &keys {
            self.storage.delete(key).await?;
        }
        Ok(keys.len())
    }

    /// Blind index of a lookup value under this tenant's index key.
    #[must_use]
    pub fn blind_index(&self, value: &str) -> String {
        crypto::blind_index(&self.index_key, value)
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, BarrierError> {
    serde_json::from_slice(bytes).map_err(|e| BarrierError::Codec {
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use locker_storage::MemoryBackend;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        title: String,
    }

    fn make_barrier(storage: &MemoryBackend, key: &EncryptionKey) -> Barrier {
        Barrier::new(Arc::new(storage.clone()), key).unwrap()
    }

    #[tokio::test]
    async fn storage_only_sees_ciphertext() {
        let storage = MemoryBackend::new();
        let barrier = make_barrier(&storage, &EncryptionKey::generate());

        barrier.put("notes/1", b"plain words").await.unwrap();
        let raw = storage.get("notes/1").await.unwrap().unwrap();
        assert_ne!(raw, b"plain words");
        assert_eq!(barrier.get("notes/1").await.unwrap(), Some(b"plain words".to_vec()));
    }

    #[tokio::test]
    async fn json_records_roundtrip_through_scan() {
        let storage = MemoryBackend::new();
        let barrier = make_barrier(&storage, &EncryptionKey::generate());

        barrier.put_json("notes/a", &Note { title: "a".into() }).await.unwrap();
        barrier.put_json("notes/b", &Note { title: "b".into() }).await.unwrap();
        barrier.put_json("other/c", &Note { title: "c".into() }).await.unwrap();

        let notes: Vec<Note> = barrier.values_json("notes/").await.unwrap();
        assert_eq!(notes, vec![Note { title: "a".into() }, Note { title: "b".into() }]);
    }

    #[tokio::test]
    async fn wrong_tenant_key_cannot_read() {
        let storage = MemoryBackend::new();
        make_barrier(&storage, &EncryptionKey::generate())
            .put("k", b"secret")
            .await
            .unwrap();

        let other = make_barrier(&storage, &EncryptionKey::generate());
        assert!(matches!(other.get("k").await, Err(BarrierError::Crypto(_))));
    }

    #[tokio::test]
    async fn mismatched_type_is_a_codec_error() {
        let storage = MemoryBackend::new();
        let barrier = make_barrier(&storage, &EncryptionKey::generate());
        barrier.put("notes/x", b"[1,2,3]").await.unwrap();

        let result = barrier.get_json::<Note>("notes/x").await;
        assert!(matches!(result, Err(BarrierError::Codec { .. })));
    }

    #[tokio::test]
    async fn delete_prefix_removes_only_matching() {
        let storage = MemoryBackend::new();
        let barrier = make_barrier(&storage, &EncryptionKey::generate());
        barrier.put("a/1", b"1").await.unwrap();
        barrier.put("a/2", b"2").await.unwrap();
        barrier.put("b/1", b"3").await.unwrap();

        assert_eq!(barrier.delete_prefix("a/").await.unwrap(), 2);
        assert!(barrier.exists("b/1").await.unwrap());
        assert!(!barrier.exists("a/1").await.unwrap());
    }

    #[tokio::test]
    async fn blind_index_is_per_tenant() {
        let storage = MemoryBackend::new();
        let a = make_barrier(&storage, &EncryptionKey::generate());
        let b = make_barrier(&storage, &EncryptionKey::generate());
        assert_eq!(a.blind_index("Bob@x.io"), a.blind_index("bob@x.io"));
        assert_ne!(a.blind_index("bob@x.io"), b.blind_index("bob@x.io"));
    }
}
