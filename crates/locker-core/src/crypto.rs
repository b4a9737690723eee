//! Cryptographic primitives for Locker.
//!
//! Vault payloads are encrypted client-side; the server adds a second layer
//! of encryption at rest and protects its own secrets (password hashes,
//! refresh tokens, blind indexes).
//!
//! - AES-256-GCM with a fresh 96-bit nonce per write, stored as
//!   `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - HKDF-SHA256 for per-tenant keys derived from the server master key.
//! - HMAC-SHA256 blind indexes for lookups by e-mail or relay address.
//! - Argon2id over the client-side master password hash.
//! - SHA-256 of opaque tokens; the plaintext token is never stored.

use std::fmt;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Minimum ciphertext length: 12-byte nonce + 16-byte AES-GCM tag.
const MIN_CIPHERTEXT_LEN: usize = 12 + 16;

/// Nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// A 256-bit key that is zeroized on drop and redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a key from 64 hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the input is not 32 bytes of hex.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(encoded.trim()).map_err(|e| CryptoError::InvalidKey {
            reason: format!("not valid hex: {e}"),
        })?;
        let bytes: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| CryptoError::InvalidKey {
            reason: format!("expected 32 bytes, got {}", v.len()),
        })?;
        Ok(Self(bytes))
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes. Never log or persist them.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt plaintext with AES-256-GCM under a fresh random nonce.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Decrypt data produced by [`encrypt`].
///
/// # Errors
///
/// - [`CryptoError::CiphertextTooShort`] if the input cannot hold a nonce and tag.
/// - [`CryptoError::Decryption`] if authentication fails.
pub fn decrypt(key: &EncryptionKey, combined: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CryptoError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| CryptoError::Decryption {
            reason: e.to_string(),
        })
}

/// Derive a sub-key from a master key with HKDF-SHA256.
///
/// `context` must be unique per purpose, e.g. `locker-tenant:eu`.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if HKDF expansion fails.
pub fn derive_key(master: &EncryptionKey, context: &str) -> Result<EncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(b"locker-v1"), master.as_bytes());
    let mut derived = [0u8; 32];
    hk.expand(context.as_bytes(), &mut derived)
        .map_err(|e| CryptoError::KeyDerivation {
            context: context.to_owned(),
            reason: e.to_string(),
        })?;
    Ok(EncryptionKey::from_bytes(derived))
}

/// Keyed HMAC-SHA256 of a normalised lookup value, hex-encoded.
///
/// Lookup values (e-mail addresses, relay addresses) are trimmed and
/// lower-cased first so that lookups are case-insensitive.
#[must_use]
pub fn blind_index(key: &EncryptionKey, value: &str) -> String {
    let normalised = value.trim().to_lowercase();
    // HMAC accepts keys of any length; a 32-byte key always succeeds.
    let mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .map(|mut mac| {
            mac.update(normalised.as_bytes());
            mac.finalize().into_bytes().to_vec()
        })
        .unwrap_or_default();
    hex::encode(mac)
}

/// SHA-256 of an opaque token, hex-encoded.
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Generate `len` random bytes from the OS CSPRNG, hex-encoded.
#[must_use]
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time string equality.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Hash a client-side master password hash with Argon2id for storage.
///
/// # Errors
///
/// Returns [`CryptoError::PasswordHash`] if hashing fails.
pub fn hash_password(client_hash: &str) -> Result<String, CryptoError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(client_hash.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CryptoError::PasswordHash {
            reason: e.to_string(),
        })
}

/// Verify a client-side master password hash against a stored Argon2 hash.
///
/// # Errors
///
/// Returns [`CryptoError::PasswordHash`] if the stored hash is unparsable.
pub fn verify_password(client_hash: &str, stored: &str) -> Result<bool, CryptoError> {
    let parsed = PasswordHash::new(stored).map_err(|e| CryptoError::PasswordHash {
        reason: e.to_string(),
    })?;
    Ok(Argon2::default()
        .verify_password(client_hash.as_bytes(), &parsed)
        .is_ok())
}
