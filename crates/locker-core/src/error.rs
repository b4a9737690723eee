//! Error types for `locker-core`.
//!
//! One enum per subsystem. Variants carry identifiers and reasons, never
//! key material, password hashes, or vault payloads.

use chrono::{DateTime, Utc};
use locker_storage::StorageError;
use uuid::Uuid;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted or tampered data).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a nonce and tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// Password hashing or hash parsing failed.
    #[error("password hashing failed: {reason}")]
    PasswordHash { reason: String },

    /// A configured key had the wrong encoding or length.
    #[error("invalid key material: {reason}")]
    InvalidKey { reason: String },
}

/// Errors from the encryption barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),

    /// A stored record could not be (de)serialized.
    #[error("record codec error at '{key}': {reason}")]
    Codec { key: String, reason: String },
}

/// Errors from tenant database routing.
#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    /// No database is registered under the alias.
    #[error("unknown tenant database: {alias}")]
    Unknown { alias: String },

    /// The alias is not a valid identifier.
    #[error("invalid tenant alias '{alias}': must match [a-z0-9_-]{{1,32}}")]
    InvalidAlias { alias: String },

    /// The alias was registered twice.
    #[error("tenant database already registered: {alias}")]
    Duplicate { alias: String },
}

/// Errors from account and authentication operations.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    /// E-mail / password pair did not match.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Too many failed logins; the account is temporarily locked.
    #[error("account locked until {until}")]
    Locked { until: DateTime<Utc> },

    /// The bearer or refresh token is malformed, revoked, or not recognised.
    #[error("invalid token: {reason}")]
    InvalidToken { reason: String },

    /// The token has expired.
    #[error("token expired")]
    TokenExpired,

    /// The user does not exist.
    #[error("user not found")]
    UserNotFound,

    /// The e-mail address is already registered.
    #[error("e-mail address already registered")]
    EmailTaken,

    /// The request was malformed.
    #[error("invalid account request: {reason}")]
    InvalidInput { reason: String },

    /// The account cannot be deleted while it is the only owner of a team.
    #[error("user is the only owner of team {team_id}")]
    SoleOwner { team_id: Uuid },

    /// Token signing failed.
    #[error("token signing failed: {reason}")]
    Signing { reason: String },

    /// Password hashing failed.
    #[error("account crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The barrier returned an error.
    #[error("account barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from vault (cipher and folder) operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The cipher or folder does not exist or is not visible to the caller.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// The caller can see the item but may not perform the operation.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// The request was malformed.
    #[error("invalid vault request: {reason}")]
    InvalidInput { reason: String },

    /// The barrier returned an error.
    #[error("vault barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from team, member, collection, and policy operations.
#[derive(Debug, thiserror::Error)]
pub enum TeamError {
    /// The team, member, or collection does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// The caller's role does not allow the operation.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// The request was malformed.
    #[error("invalid team request: {reason}")]
    InvalidInput { reason: String },

    /// The operation conflicts with existing state.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// Every seat on the team's plan is taken. `in_use` can exceed `seats`
    /// after a downgrade.
    #[error("team has no free seats ({in_use} in use, limit {seats})")]
    SeatLimit { seats: u32, in_use: u32 },

    /// The barrier returned an error.
    #[error("team barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from the emergency access state machine.
#[derive(Debug, thiserror::Error)]
pub enum EmergencyError {
    /// The grant does not exist or does not involve the caller.
    #[error("emergency access not found: {id}")]
    NotFound { id: Uuid },

    /// The caller is a party to the grant but not the one allowed to act.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// The action is not valid from the grant's current status.
    #[error("cannot {action} emergency access in status '{status}'")]
    InvalidTransition {
        status: &'static str,
        action: &'static str,
    },

    /// The request was malformed.
    #[error("invalid emergency access request: {reason}")]
    InvalidInput { reason: String },

    /// An active grant already exists for this grantee.
    #[error("emergency access already granted to this contact")]
    Duplicate,

    /// The grantor's plan does not include emergency access.
    #[error("emergency access requires a premium plan")]
    NotEntitled,

    /// Password hashing failed during takeover.
    #[error("emergency access crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The barrier returned an error.
    #[error("emergency access barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from billing and payment operations.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// The subscription, payment, or promo code does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The request was malformed.
    #[error("invalid billing request: {reason}")]
    InvalidInput { reason: String },

    /// The promo code cannot be applied.
    #[error("promo code rejected: {reason}")]
    InvalidPromo { reason: String },

    /// The payment provider declined the charge.
    #[error("payment declined: {reason}")]
    PaymentDeclined { reason: String },

    /// The payment provider could not be reached or failed.
    #[error("payment gateway error: {reason}")]
    Gateway { reason: String },

    /// The operation conflicts with the subscription's state.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// The barrier returned an error.
    #[error("billing barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from relay alias operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The alias does not exist or belongs to someone else.
    #[error("relay alias not found: {id}")]
    NotFound { id: Uuid },

    /// The plan's alias allowance is used up.
    #[error("relay alias limit reached ({limit})")]
    LimitReached { limit: u32 },

    /// The request was malformed.
    #[error("invalid relay request: {reason}")]
    InvalidInput { reason: String },

    /// The address is already taken.
    #[error("relay address already in use")]
    AddressTaken,

    /// Custom addresses need a paid plan.
    #[error("custom relay addresses require a paid plan")]
    NotEntitled,

    /// The barrier returned an error.
    #[error("relay barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from activity event sinks.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// A sink failed to persist the event.
    #[error("event sink '{name}' failed: {reason}")]
    Sink { name: String, reason: String },

    /// The event could not be serialized.
    #[error("event serialization failed: {reason}")]
    Serialization { reason: String },

    /// The barrier returned an error.
    #[error("event barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

/// Errors from operations that span several subsystems, such as account
/// deletion or sync.
#[derive(Debug, thiserror::Error)]
pub enum LockerError {
    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Team(#[from] TeamError),

    #[error(transparent)]
    Emergency(#[from] EmergencyError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Barrier(#[from] BarrierError),
}
