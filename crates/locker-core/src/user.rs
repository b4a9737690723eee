//! User accounts.
//!
//! The server never sees a master password. Clients derive a key from it
//! with the account's KDF parameters, then send a hash of that key; the
//! server stores an Argon2id hash of the client hash. The account's
//! symmetric key travels and rests encrypted under the master key.
//!
//! Storage layout:
//!
//! - `users/{id}`: the [`User`] record.
//! - `user-emails/{blind_index}`: user id, for case-insensitive lookup.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::barrier::Barrier;
use crate::crypto;
use crate::error::{AccountError, BarrierError};

const USER_PREFIX: &str = "users/";
const EMAIL_INDEX_PREFIX: &str = "user-emails/";

/// Longest accepted e-mail address.
const MAX_EMAIL_LEN: usize = 254;

/// Password-based key derivation function used client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfKind {
    Pbkdf2Sha256,
    Argon2id,
}

/// Client-side KDF parameters, handed out at prelogin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub kind: KdfKind,
    pub iterations: u32,
    /// Memory in MiB (Argon2id only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u32>,
    /// Lanes (Argon2id only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            kind: KdfKind::Pbkdf2Sha256,
            iterations: 600_000,
            memory_mib: None,
            parallelism: None,
        }
    }
}

impl KdfParams {
    /// Reject parameters too weak to protect a master password.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::InvalidInput`] naming the weak parameter.
    pub fn validate(&self) -> Result<(), AccountError> {
        let invalid = |reason: &str| {
            Err(AccountError::InvalidInput {
                reason: reason.to_owned(),
            })
        };
        match self.kind {
            KdfKind::Pbkdf2Sha256 if self.iterations < 100_000 => {
                invalid("pbkdf2 iterations must be at least 100000")
            }
            KdfKind::Argon2id if self.iterations < 2 => invalid("argon2 iterations must be at least 2"),
            KdfKind::Argon2id if self.memory_mib.is_none_or(|m| !(15..=1024).contains(&m)) => {
                invalid("argon2 memory must be between 15 and 1024 MiB")
            }
            KdfKind::Argon2id if self.parallelism.is_none_or(|p| !(1..=16).contains(&p)) => {
                invalid("argon2 parallelism must be between 1 and 16")
            }
            _ => Ok(()),
        }
    }
}

/// A stored user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Lower-cased e-mail address.
    pub email: String,
    pub name: Option<String>,
    /// Argon2id hash of the client-side master password hash.
    pub password_hash: String,
    pub password_hint: Option<String>,
    pub kdf: KdfParams,
    /// Account symmetric key, encrypted by the client under the master key.
    pub key: String,
    pub public_key: Option<String>,
    /// Private key, encrypted by the client under the account key.
    pub encrypted_private_key: Option<String>,
    /// Rotated whenever outstanding sessions must stop working.
    pub security_stamp: String,
    /// Bumped on every change a client must sync.
    pub revision_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub failed_logins: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// The parts of a [`User`] a client may read.
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub kdf: KdfParams,
    pub key: String,
    pub public_key: Option<String>,
    pub encrypted_private_key: Option<String>,
    pub revision_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for Profile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            kdf: user.kdf,
            key: user.key.clone(),
            public_key: user.public_key.clone(),
            encrypted_private_key: user.encrypted_private_key.clone(),
            revision_date: user.revision_date,
            created_at: user.created_at,
        }
    }
}

/// Input for creating an account.
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub email: String,
    pub name: Option<String>,
    /// Client-side master password hash.
    pub master_password_hash: String,
    pub master_password_hint: Option<String>,
    #[serde(default)]
    pub kdf: KdfParams,
    pub key: String,
    pub public_key: Option<String>,
    pub encrypted_private_key: Option<String>,
}

/// Fields a user may change on their own profile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub password_hint: Option<String>,
    pub public_key: Option<String>,
    pub encrypted_private_key: Option<String>,
}

/// Normalise and sanity-check an e-mail address.
///
/// # Errors
///
/// Returns [`AccountError::InvalidInput`] if the address is obviously malformed.
pub fn normalize_email(email: &str) -> Result<String, AccountError> {
    let email = email.trim().to_lowercase();
    let valid = email.len() <= MAX_EMAIL_LEN
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.'))
        && !email.contains(char::is_whitespace);
    if valid {
        Ok(email)
    } else {
        Err(AccountError::InvalidInput {
            reason: "malformed e-mail address".to_owned(),
        })
    }
}

/// Fresh security stamp.
#[must_use]
pub fn new_security_stamp() -> String {
    crypto::random_hex(16)
}

/// Persistence for user accounts.
#[derive(Clone)]
pub struct UserStore {
    barrier: Arc<Barrier>,
}

impl UserStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Create an account.
    ///
    /// # Errors
    ///
    /// - [`AccountError::InvalidInput`] for a malformed e-mail, empty key
    ///   material, or weak KDF parameters.
    /// - [`AccountError::EmailTaken`] if the e-mail is registered.
    pub async fn create(&self, registration: Registration) -> Result<User, AccountError> {
        let email = normalize_email(&registration.email)?;
        registration.kdf.validate()?;
        if registration.master_password_hash.is_empty() || registration.key.is_empty() {
            return Err(AccountError::InvalidInput {
                reason: "master password hash and key are required".to_owned(),
            });
        }

        let index_key = self.email_key(&email);
        if self.barrier.exists(&index_key).await? {
            return Err(AccountError::EmailTaken);
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email,
            name: registration.name,
            password_hash: crypto::hash_password(&registration.master_password_hash)?,
            password_hint: registration.master_password_hint,
            kdf: registration.kdf,
            key: registration.key,
            public_key: registration.public_key,
            encrypted_private_key: registration.encrypted_private_key,
            security_stamp: new_security_stamp(),
            revision_date: now,
            created_at: now,
            failed_logins: 0,
            locked_until: None,
            last_login_at: None,
        };

        self.save(&user).await?;
        self.barrier.put_json(&index_key, &user.id).await?;
        info!(user_id = %user.id, "account registered");
        Ok(user)
    }

    /// Fetch a user by id.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Barrier`] if storage fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<User>, AccountError> {
        Ok(self.barrier.get_json(&format!("{USER_PREFIX}{id}")).await?)
    }

    /// Fetch a user by id, failing if absent.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::UserNotFound`] if there is no such user.
    pub async fn require(&self, id: Uuid) -> Result<User, AccountError> {
        self.get(id).await?.ok_or(AccountError::UserNotFound)
    }

    /// Look a user up by e-mail, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Barrier`] if storage fails.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, AccountError> {
        let id: Option<Uuid> = self.barrier.get_json(&self.email_key(email)).await?;
        match id {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    /// Persist a user record as-is.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Barrier`] if storage fails.
    pub async fn save(&self, user: &User) -> Result<(), AccountError> {
        self.barrier
            .put_json(&format!("{USER_PREFIX}{}", user.id), user)
            .await?;
        Ok(())
    }

    /// Apply a profile update and bump the revision date.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::UserNotFound`] if the user is gone.
    pub async fn update_profile(&self, id: Uuid, update: ProfileUpdate) -> Result<User, AccountError> {
        let mut user = self.require(id).await?;
        if let Some(name) = update.name {
            user.name = Some(name);
        }
        if let Some(hint) = update.password_hint {
            user.password_hint = Some(hint).filter(|h| !h.is_empty());
        }
        if let Some(public_key) = update.public_key {
            user.public_key = Some(public_key);
        }
        if let Some(private_key) = update.encrypted_private_key {
            user.encrypted_private_key = Some(private_key);
        }
        user.revision_date = Utc::now();
        self.save(&user).await?;
        Ok(user)
    }

    /// Replace the master password hash and encrypted key, rotating the
    /// security stamp so every outstanding access token stops working.
    ///
    /// # Errors
    ///
    /// - [`AccountError::InvalidInput`] if the new hash or key is empty.
    /// - [`AccountError::Crypto`] if hashing fails.
    pub async fn set_password(
        &self,
        user: &mut User,
        new_password_hash: &str,
        new_key: String,
        kdf: Option<KdfParams>,
    ) -> Result<(), AccountError> {
        if new_password_hash.is_empty() || new_key.is_empty() {
            return Err(AccountError::InvalidInput {
                reason: "new master password hash and key are required".to_owned(),
            });
        }
        if let Some(kdf) = kdf {
            kdf.validate()?;
            user.kdf = kdf;
        }
        user.password_hash = crypto::hash_password(new_password_hash)?;
        user.key = new_key;
        user.security_stamp = new_security_stamp();
        user.failed_logins = 0;
        user.locked_until = None;
        user.revision_date = Utc::now();
        self.save(user).await?;
        info!(user_id = %user.id, "master password changed");
        Ok(())
    }

    /// Bump the revision date of each user so their clients resync.
    ///
    /// Missing users are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] if storage fails.
    pub async fn touch(&self, ids: &[Uuid]) -> Result<(), BarrierError> {
        let now = Utc::now();
        for id in ids {
            let key = format!("{USER_PREFIX}{id}");
            if let Some(mut user) = self.barrier.get_json::<User>(&key).await? {
                user.revision_date = now;
                self.barrier.put_json(&key, &user).await?;
            }
        }
        Ok(())
    }

    /// Remove a user record and its e-mail index.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Barrier`] if storage fails.
    pub async fn delete(&self, user: &User) -> Result<(), AccountError> {
        self.barrier.delete(&self.email_key(&user.email)).await?;
        self.barrier.delete(&format!("{USER_PREFIX}{}", user.id)).await?;
        info!(user_id = %user.id, "account deleted");
        Ok(())
    }

    /// Every user id in the tenant.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Barrier`] if storage fails.
    pub async fn ids(&self) -> Result<Vec<Uuid>, AccountError> {
        Ok(self
            .barrier
            .list(USER_PREFIX)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(USER_PREFIX))
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }

    fn email_key(&self, email: &str) -> String {
        format!("{EMAIL_INDEX_PREFIX}{}", self.barrier.blind_index(email))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::crypto::EncryptionKey;
    use locker_storage::{MemoryBackend, Record, StorageBackend, StorageError};

    pub(crate) fn barrier() -> Arc<Barrier> {
        Arc::new(Barrier::new(Arc::new(MemoryBackend::new()), &EncryptionKey::generate()).unwrap())
    }

    /// Memory backend whose reads fail under one key prefix once armed.
    #[derive(Default)]
    pub(crate) struct FlakyBackend {
        inner: MemoryBackend,
        failing: Mutex<Option<String>>,
    }

    impl FlakyBackend {
        pub(crate) fn fail_reads_under(&self, prefix: &str) {
            *self.failing.lock().unwrap() = Some(prefix.to_owned());
        }

        fn check(&self, key: &str) -> Result<(), StorageError> {
            match self.failing.lock().unwrap().as_deref() {
                Some(prefix) if key.starts_with(prefix) => Err(StorageError::Read {
                    key: key.to_owned(),
                    reason: "connection reset by peer".to_owned(),
                }),
                _ => Ok(()),
            }
        }
    }

    #[async_trait::async_trait]
    impl StorageBackend for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.check(key)?;
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.check(prefix)?;
            self.inner.list(prefix).await
        }

        async fn scan(&self, prefix: &str) -> Result<Vec<Record>, StorageError> {
            self.check(prefix)?;
            self.inner.scan(prefix).await
        }
    }

    pub(crate) fn flaky_barrier() -> (Arc<FlakyBackend>, Arc<Barrier>) {
        let backend = Arc::new(FlakyBackend::default());
        let storage: Arc<dyn StorageBackend> = Arc::<FlakyBackend>::clone(&backend);
        let barrier = Arc::new(Barrier::new(storage, &EncryptionKey::generate()).unwrap());
        (backend, barrier)
    }

    pub(crate) fn registration(email: &str) -> Registration {
        Registration {
            email: email.to_owned(),
            name: Some("Test".to_owned()),
            master_password_hash: "client-hash".to_owned(),
            master_password_hint: None,
            kdf: KdfParams::default(),
            key: "2.encrypted-user-key".to_owned(),
            public_key: Some("public".to_owned()),
            encrypted_private_key: Some("2.private".to_owned()),
        }
    }

    #[tokio::test]
    async fn create_and_find_case_insensitive() {
        let store = UserStore::new(barrier());
        let user = store.create(registration("Alice@Example.com")).await.unwrap();
        assert_eq!(user.email, "alice@example.com");

        let found = store.find_by_email("ALICE@example.COM").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(crypto::verify_password("client-hash", &found.password_hash).unwrap());
    }

    #[tokio::test]
    async fn duplicate_email_rejected() {
        let store = UserStore::new(barrier());
        store.create(registration("a@b.io")).await.unwrap();
        assert!(matches!(
            store.create(registration(" A@B.io")).await,
            Err(AccountError::EmailTaken)
        ));
    }

    #[tokio::test]
    async fn weak_kdf_rejected() {
        let store = UserStore::new(barrier());
        let mut reg = registration("a@b.io");
        reg.kdf.iterations = 5_000;
        assert!(matches!(store.create(reg).await, Err(AccountError::InvalidInput { .. })));

        let mut reg = registration("a@b.io");
        reg.kdf = KdfParams {
            kind: KdfKind::Argon2id,
            iterations: 3,
            memory_mib: Some(64),
            parallelism: Some(4),
        };
        assert!(store.create(reg).await.is_ok());
    }

    #[test]
    fn email_validation() {
        assert!(normalize_email("x@y.z").is_ok());
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@y.z").is_err());
        assert!(normalize_email("x@localhost").is_err());
        assert!(normalize_email("x y@z.io").is_err());
    }

    #[tokio::test]
    async fn set_password_rotates_stamp() {
        let store = UserStore::new(barrier());
        let mut user = store.create(registration("a@b.io")).await.unwrap();
        let old_stamp = user.security_stamp.clone();

        store
            .set_password(&mut user, "new-hash", "2.new-key".to_owned(), None)
            .await
            .unwrap();

        let stored = store.require(user.id).await.unwrap();
        assert_ne!(stored.security_stamp, old_stamp);
        assert_eq!(stored.key, "2.new-key");
        assert!(crypto::verify_password("new-hash", &stored.password_hash).unwrap());
    }

    #[tokio::test]
    async fn delete_frees_the_email() {
        let store = UserStore::new(barrier());
        let user = store.create(registration("a@b.io")).await.unwrap();
        store.delete(&user).await.unwrap();
        assert!(store.get(user.id).await.unwrap().is_none());
        assert!(store.create(registration("a@b.io")).await.is_ok());
    }
}
