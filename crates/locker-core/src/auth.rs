//! Authentication: login, bearer tokens, refresh tokens.
//!
//! Access tokens are short-lived HS256 JWTs. Each carries the tenant alias
//! and the user's security stamp; rotating the stamp (password change,
//! emergency takeover) invalidates every outstanding access token at the
//! next request.
//!
//! Refresh tokens are opaque (`lrt_` + 256 random bits). Only their SHA-256
//! hash is stored, under `tokens/refresh/{hash}`, with a per-user index at
//! `tokens/user/{user_id}/{hash}`. A refresh token is single-use: redeeming
//! it deletes it and issues a new pair.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::barrier::Barrier;
use crate::crypto;
use crate::error::AccountError;
use crate::user::{KdfParams, Registration, User, UserStore};

const REFRESH_PREFIX: &str = "tokens/refresh/";
const USER_TOKENS_PREFIX: &str = "tokens/user/";
const REFRESH_TOKEN_MARKER: &str = "lrt_";
const ISSUER: &str = "locker";

/// Access token lifetime.
pub const ACCESS_TTL_SECS: i64 = 3600;

/// Refresh token lifetime.
pub const REFRESH_TTL_DAYS: i64 = 30;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User id.
    pub sub: Uuid,
    pub email: String,
    /// Tenant alias the user lives in.
    pub tenant: String,
    /// Security stamp at issue time.
    pub stamp: String,
    /// Client device identifier.
    pub device: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Access + refresh token pair returned by login and refresh.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

/// HS256 signing keys, shared by every tenant of a deployment.
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtKeys {
    /// Build keys from a shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::InvalidInput`] if the secret is shorter than
    /// 32 bytes.
    pub fn new(secret: &[u8]) -> Result<Self, AccountError> {
        if secret.len() < 32 {
            return Err(AccountError::InvalidInput {
                reason: "jwt secret must be at least 32 bytes".to_owned(),
            });
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.leeway = 0;
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        })
    }

    /// Sign an access token for `user` in `tenant`.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Signing`] if encoding fails.
    pub fn sign(&self, user: &User, tenant: &str, device: &str, now: DateTime<Utc>) -> Result<String, AccountError> {
        let claims = AccessClaims {
            sub: user.id,
            email: user.email.clone(),
            tenant: tenant.to_owned(),
            stamp: user.security_stamp.clone(),
            device: device.to_owned(),
            iss: ISSUER.to_owned(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ACCESS_TTL_SECS)).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| AccountError::Signing {
            reason: e.to_string(),
        })
    }

    /// Verify signature, issuer, and expiry of an access token.
    ///
    /// # Errors
    ///
    /// - [`AccountError::TokenExpired`] if `exp` has passed.
    /// - [`AccountError::InvalidToken`] for anything else.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, AccountError> {
        decode::<AccessClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AccountError::TokenExpired,
                _ => {
                    debug!(error = %e, "access token rejected");
                    AccountError::InvalidToken {
                        reason: "signature or claims invalid".to_owned(),
                    }
                }
            })
    }
}

impl fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtKeys").finish_non_exhaustive()
    }
}

/// A stored refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRecord {
    pub token_hash: String,
    pub user_id: Uuid,
    pub device: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Persistence for refresh tokens.
#[derive(Clone)]
pub struct RefreshTokenStore {
    barrier: Arc<Barrier>,
}

impl RefreshTokenStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Mint a refresh token. Returns the plaintext, which is never stored.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Barrier`] if storage fails.
    pub async fn issue(&self, user_id: Uuid, device: &str, now: DateTime<Utc>) -> Result<String, AccountError> {
        let plaintext = format!("{REFRESH_TOKEN_MARKER}{}", crypto::random_hex(32));
        let record = RefreshRecord {
            token_hash: crypto::hash_token(&plaintext),
            user_id,
            device: device.to_owned(),
            created_at: now,
            expires_at: now + Duration::days(REFRESH_TTL_DAYS),
        };
        self.barrier
            .put_json(&format!("{REFRESH_PREFIX}{}", record.token_hash), &record)
            .await?;
        self.barrier
            .put_json(&format!("{USER_TOKENS_PREFIX}{user_id}/{}", record.token_hash), &record.device)
            .await?;
        Ok(plaintext)
    }

    /// Consume a refresh token. It is deleted whether or not it has expired.
    ///
    /// # Errors
    ///
    /// - [`AccountError::InvalidToken`] if the token is unknown.
    /// - [`AccountError::TokenExpired`] if it has expired.
    pub async fn redeem(&self, plaintext: &str, now: DateTime<Utc>) -> Result<RefreshRecord, AccountError> {
        if !plaintext.starts_with(REFRESH_TOKEN_MARKER) {
            return Err(AccountError::InvalidToken {
                reason: "not a refresh token".to_owned(),
            });
        }
        let hash = crypto::hash_token(plaintext);
        let record: RefreshRecord = self
            .barrier
            .get_json(&format!("{REFRESH_PREFIX}{hash}"))
            .await?
            .ok_or_else(|| AccountError::InvalidToken {
                reason: "unknown or revoked refresh token".to_owned(),
            })?;
        self.remove(&record).await?;

        if record.expires_at <= now {
            return Err(AccountError::TokenExpired);
        }
        Ok(record)
    }

    /// Revoke every refresh token of a user, or only those of one device.
    /// Returns how many were revoked.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Barrier`] if storage fails.
    pub async fn revoke(&self, user_id: Uuid, device: Option<&str>) -> Result<usize, AccountError> {
        let prefix = format!("{USER_TOKENS_PREFIX}{user_id}/");
        let mut revoked = 0usize;
        for (key, token_device) in self.barrier.scan_json::<String>(&prefix).await? {
            if device.is_some_and(|d| d != token_device) {
                continue;
            }
            if let Some(hash) = key.strip_prefix(&prefix) {
                self.barrier.delete(&format!("{REFRESH_PREFIX}{hash}")).await?;
            }
            self.barrier.delete(&key).await?;
            revoked = revoked.saturating_add(1);
        }
        Ok(revoked)
    }

    /// Delete every expired refresh token. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Barrier`] if storage fails.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, AccountError> {
        let mut purged = 0usize;
        for record in self.barrier.values_json::<RefreshRecord>(REFRESH_PREFIX).await? {
            if record.expires_at <= now {
                self.remove(&record).await?;
                purged = purged.saturating_add(1);
            }
        }
        Ok(purged)
    }

    async fn remove(&self, record: &RefreshRecord) -> Result<(), AccountError> {
        self.barrier
            .delete(&format!("{REFRESH_PREFIX}{}", record.token_hash))
            .await?;
        self.barrier
            .delete(&format!("{USER_TOKENS_PREFIX}{}/{}", record.user_id, record.token_hash))
            .await?;
        Ok(())
    }
}

/// Failed-login lockout thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutRule {
    pub max_failures: u32,
    pub lock_for: Duration,
}

impl Default for LockoutRule {
    fn default() -> Self {
        Self {
            max_failures: 5,
            lock_for: Duration::minutes(15),
        }
    }
}

/// Credentials presented at login.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub master_password_hash: String,
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_device() -> String {
    "web".to_owned()
}

/// Account lifecycle and session handling for one tenant.
#[derive(Clone)]
pub struct AuthService {
    tenant: String,
    users: UserStore,
    refresh: RefreshTokenStore,
    keys: Arc<JwtKeys>,
}

impl AuthService {
    #[must_use]
    pub fn new(tenant: &str, barrier: Arc<Barrier>, keys: Arc<JwtKeys>) -> Self {
        Self {
            tenant: tenant.to_owned(),
            users: UserStore::new(Arc::clone(&barrier)),
            refresh: RefreshTokenStore::new(barrier),
            keys,
        }
    }

    #[must_use]
    pub fn refresh_tokens(&self) -> &RefreshTokenStore {
        &self.refresh
    }

    /// Create an account.
    ///
    /// # Errors
    ///
    /// See [`UserStore::create`].
    pub async fn register(&self, registration: Registration) -> Result<User, AccountError> {
        self.users.create(registration).await
    }

    /// KDF parameters for an e-mail address.
    ///
    /// Unknown addresses get the default parameters so that prelogin does
    /// not reveal which addresses are registered.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Barrier`] if storage fails.
    pub async fn prelogin(&self, email: &str) -> Result<KdfParams, AccountError> {
        Ok(self
            .users
            .find_by_email(email)
            .await?
            .map(|u| u.kdf)
            .unwrap_or_default())
    }

    /// Verify credentials and open a session.
    ///
    /// # Errors
    ///
    /// - [`AccountError::Locked`] while the account is locked out.
    /// - [`AccountError::InvalidCredentials`] on unknown e-mail or wrong hash.
    pub async fn login(&self, request: &LoginRequest, rule: LockoutRule) -> Result<(User, TokenPair), AccountError> {
        let device = validate_device(&request.device)?;
        let now = Utc::now();
        let Some(mut user) = self.users.find_by_email(&request.email).await? else {
            return Err(AccountError::InvalidCredentials);
        };

        if let Some(until) = user.locked_until.filter(|until| *until > now) {
            return Err(AccountError::Locked { until });
        }

        if !crypto::verify_password(&request.master_password_hash, &user.password_hash)? {
            user.failed_logins = user.failed_logins.saturating_add(1);
            if user.failed_logins >= rule.max_failures {
                let until = now + rule.lock_for;
                user.locked_until = Some(until);
                user.failed_logins = 0;
                warn!(user_id = %user.id, %until, "account locked after repeated failed logins");
            }
            self.users.save(&user).await?;
            return Err(AccountError::InvalidCredentials);
        }

        user.failed_logins = 0;
        user.locked_until = None;
        user.last_login_at = Some(now);
        self.users.save(&user).await?;

        let tokens = self.issue(&user, device, now).await?;
        info!(user_id = %user.id, device, "user logged in");
        Ok((user, tokens))
    }

    /// Exchange a refresh token for a fresh pair.
    ///
    /// # Errors
    ///
    /// - [`AccountError::InvalidToken`] / [`AccountError::TokenExpired`] for a
    ///   bad refresh token.
    /// - [`AccountError::UserNotFound`] if the account was deleted.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AccountError> {
        let now = Utc::now();
        let record = self.refresh.redeem(refresh_token, now).await?;
        let user = self.users.require(record.user_id).await?;
        self.issue(&user, &record.device, now).await
    }

    /// Resolve verified claims to the current user.
    ///
    /// # Errors
    ///
    /// - [`AccountError::InvalidToken`] if the claims belong to another
    ///   tenant or the security stamp has been rotated.
    /// - [`AccountError::UserNotFound`] if the account no longer exists.
    pub async fn authenticate(&self, claims: &AccessClaims) -> Result<User, AccountError> {
        if claims.tenant != self.tenant {
            return Err(AccountError::InvalidToken {
                reason: "token issued for another tenant".to_owned(),
            });
        }
        let user = self.users.require(claims.sub).await?;
        if !crypto::constant_time_eq(&claims.stamp, &user.security_stamp) {
            return Err(AccountError::InvalidToken {
                reason: "session revoked".to_owned(),
            });
        }
        Ok(user)
    }

    /// End a device's session by revoking its refresh tokens.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Barrier`] if storage fails.
    pub async fn logout(&self, user_id: Uuid, device: &str) -> Result<usize, AccountError> {
        self.refresh.revoke(user_id, Some(device)).await
    }

    /// Check a presented master password hash against the stored one.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::InvalidCredentials`] on mismatch.
    pub fn verify_master_password(&self, user: &User, master_password_hash: &str) -> Result<(), AccountError> {
        if crypto::verify_password(master_password_hash, &user.password_hash)? {
            Ok(())
        } else {
            Err(AccountError::InvalidCredentials)
        }
    }

    /// Change the master password. Every session, including the caller's,
    /// is ended.
    ///
    /// # Errors
    ///
    /// - [`AccountError::InvalidCredentials`] if the current hash is wrong.
    /// - [`AccountError::InvalidInput`] for empty or weak new parameters.
    pub async fn change_password(
        &self,
        user: &mut User,
        current_hash: &str,
        new_hash: &str,
        new_key: String,
        kdf: Option<KdfParams>,
    ) -> Result<(), AccountError> {
        self.verify_master_password(user, current_hash)?;
        self.users.set_password(user, new_hash, new_key, kdf).await?;
        self.refresh.revoke(user.id, None).await?;
        Ok(())
    }

    async fn issue(&self, user: &User, device: &str, now: DateTime<Utc>) -> Result<TokenPair, AccountError> {
        Ok(TokenPair {
            access_token: self.keys.sign(user, &self.tenant, device, now)?,
            refresh_token: self.refresh.issue(user.id, device, now).await?,
            token_type: "Bearer",
            expires_in: ACCESS_TTL_SECS,
        })
    }
}

fn validate_device(device: &str) -> Result<&str, AccountError> {
    let device = device.trim();
    if device.is_empty() || device.len() > 64 {
        return Err(AccountError::InvalidInput {
            reason: "device identifier must be 1-64 characters".to_owned(),
        });
    }
    Ok(device)
}
