//! Emergency access.
//!
//! A grantor names a trusted contact (the grantee) who may request access
//! to the grantor's vault. The request is granted when the grantor
//! approves it, or automatically once the wait time elapses without a
//! rejection.
//!
//! ```text
//! invited ──accept──▶ accepted ──confirm──▶ confirmed ──initiate──▶ recovery_initiated
//!                                               ▲                      │        │
//!                                               └────────reject────────┘   approve / wait
//!                                               ▲                               ▼
//!                                               └────────reject──────── recovery_approved
//! ```
//!
//! Storage layout:
//!
//! - `emergency/grants/{id}`: [`EmergencyAccess`].
//! - `emergency/grantor/{grantor_id}/{id}`: grants a user has given.
//! - `emergency/grantee/{grantee_id}/{id}`: grants a user has accepted.
//! - `emergency/invites/{email_index}/{id}`: grants awaiting acceptance.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::RefreshTokenStore;
use crate::barrier::Barrier;
use crate::error::{AccountError, EmergencyError, VaultError};
use crate::permission::CipherAccess;
use crate::user::{KdfParams, User, UserStore, normalize_email};
use crate::vault::{CipherView, VaultService};

const GRANT_PREFIX: &str = "emergency/grants/";
const GRANTOR_PREFIX: &str = "emergency/grantor/";
const GRANTEE_PREFIX: &str = "emergency/grantee/";
const INVITE_PREFIX: &str = "emergency/invites/";

/// Bounds on the wait time, in days.
pub const MIN_WAIT_DAYS: u16 = 1;
pub const MAX_WAIT_DAYS: u16 = 90;

/// Reminders to the grantor are sent at most this often.
const REMINDER_INTERVAL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyKind {
    /// Read-only access to the grantor's personal vault.
    View,
    /// Permission to set a new master password on the grantor's account.
    Takeover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyStatus {
    Invited,
    Accepted,
    Confirmed,
    RecoveryInitiated,
    RecoveryApproved,
}

impl EmergencyStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invited => "invited",
            Self::Accepted => "accepted",
            Self::Confirmed => "confirmed",
            Self::RecoveryInitiated => "recovery_initiated",
            Self::RecoveryApproved => "recovery_approved",
        }
    }
}

/// A transition of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyAction {
    Accept,
    Confirm,
    Initiate,
    Approve,
    Reject,
}

impl EmergencyAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Confirm => "confirm",
            Self::Initiate => "initiate",
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

/// The status an action leads to, or `None` if the action is not allowed
/// from `status`.
#[must_use]
pub const fn next_status(status: EmergencyStatus, action: EmergencyAction) -> Option<EmergencyStatus> {
    use EmergencyAction as A;
    use EmergencyStatus as S;
    match (status, action) {
        (S::Invited, A::Accept) => Some(S::Accepted),
        (S::Accepted, A::Confirm) => Some(S::Confirmed),
        (S::Confirmed, A::Initiate) => Some(S::RecoveryInitiated),
        (S::RecoveryInitiated, A::Approve) => Some(S::RecoveryApproved),
        (S::RecoveryInitiated | S::RecoveryApproved, A::Reject) => Some(S::Confirmed),
        _ => None,
    }
}

/// An emergency access grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyAccess {
    pub id: Uuid,
    pub grantor_id: Uuid,
    /// Set when the grantee accepts.
    pub grantee_id: Option<Uuid>,
    pub grantee_email: String,
    pub kind: EmergencyKind,
    pub status: EmergencyStatus,
    pub wait_days: u16,
    /// Grantor's account key encrypted to the grantee's public key. Set at
    /// confirm.
    pub key_encrypted: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub recovery_initiated_at: Option<DateTime<Utc>>,
    pub last_notification_at: Option<DateTime<Utc>>,
}

impl EmergencyAccess {
    /// When an initiated recovery approves itself.
    #[must_use]
    pub fn auto_approve_at(&self) -> Option<DateTime<Utc>> {
        self.recovery_initiated_at
            .map(|at| at + Duration::days(i64::from(self.wait_days)))
    }

    fn involves(&self, user_id: Uuid) -> bool {
        self.grantor_id == user_id || self.grantee_id == Some(user_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyInvite {
    pub email: String,
    pub kind: EmergencyKind,
    pub wait_days: u16,
}

/// What a takeover grantee needs to re-key the grantor's account.
#[derive(Debug, Clone, Serialize)]
pub struct TakeoverMaterial {
    pub kdf: KdfParams,
    pub key_encrypted: String,
}

#[derive(Clone)]
pub struct EmergencyService {
    barrier: Arc<Barrier>,
    users: UserStore,
    vault: VaultService,
    refresh: RefreshTokenStore,
}

impl EmergencyService {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            users: UserStore::new(Arc::clone(&barrier)),
            vault: VaultService::new(Arc::clone(&barrier)),
            refresh: RefreshTokenStore::new(Arc::clone(&barrier)),
            barrier,
        }
    }

    // ── Grantor side ──────────────────────────────────────────────────

    /// Name a trusted contact. `premium` is the grantor's entitlement.
    ///
    /// # Errors
    ///
    /// - [`EmergencyError::NotEntitled`] without premium features.
    /// - [`EmergencyError::InvalidInput`] for self-invites, malformed
    ///   addresses, or a wait time outside 1-90 days.
    /// - [`EmergencyError::Duplicate`] if the contact already has a grant.
    pub async fn invite(&self, grantor: &User, invite: EmergencyInvite, premium: bool) -> Result<EmergencyAccess, EmergencyError> {
        if !premium {
            return Err(EmergencyError::NotEntitled);
        }
        let email = normalize_email(&invite.email).map_err(account_error)?;
        if email == grantor.email {
            return Err(EmergencyError::InvalidInput {
                reason: "cannot grant emergency access to yourself".to_owned(),
            });
        }
        if !(MIN_WAIT_DAYS..=MAX_WAIT_DAYS).contains(&invite.wait_days) {
            return Err(EmergencyError::InvalidInput {
                reason: format!("wait time must be {MIN_WAIT_DAYS}-{MAX_WAIT_DAYS} days"),
            });
        }
        if self.granted_by(grantor.id).await?.iter().any(|g| g.grantee_email == email) {
            return Err(EmergencyError::Duplicate);
        }

        let now = Utc::now();
        let grant = EmergencyAccess {
            id: Uuid::new_v4(),
            grantor_id: grantor.id,
            grantee_id: None,
            grantee_email: email,
            kind: invite.kind,
            status: EmergencyStatus::Invited,
            wait_days: invite.wait_days,
            key_encrypted: None,
            created_at: now,
            updated_at: now,
            recovery_initiated_at: None,
            last_notification_at: None,
        };
        self.save(&grant).await?;
        self.barrier
            .put_json(&format!("{GRANTOR_PREFIX}{}/{}", grantor.id, grant.id), &true)
            .await?;
        self.barrier.put_json(&self.invite_key(&grant), &true).await?;
        info!(grant_id = %grant.id, grantor_id = %grantor.id, kind = ?grant.kind, "emergency contact invited");
        Ok(grant)
    }

    /// Grants a user has given.
    ///
    /// # Errors
    ///
    /// Returns [`EmergencyError::Barrier`] if storage fails.
    pub async fn granted_by(&self, grantor_id: Uuid) -> Result<Vec<EmergencyAccess>, EmergencyError> {
        self.indexed(&format!("{GRANTOR_PREFIX}{grantor_id}/")).await
    }

    /// Share the encrypted account key with an accepted grantee.
    ///
    /// # Errors
    ///
    /// - [`EmergencyError::Forbidden`] unless the caller is the grantor.
    /// - [`EmergencyError::InvalidTransition`] unless the grant is accepted.
    pub async fn confirm(&self, grantor_id: Uuid, grant_id: Uuid, key_encrypted: String) -> Result<EmergencyAccess, EmergencyError> {
        if key_encrypted.trim().is_empty() {
            return Err(EmergencyError::InvalidInput {
                reason: "encrypted key is required".to_owned(),
            });
        }
        let mut grant = self.as_grantor(grantor_id, grant_id).await?;
        transition(&mut grant, EmergencyAction::Confirm)?;
        grant.key_encrypted = Some(key_encrypted);
        self.save(&grant).await?;
        Ok(grant)
    }

    /// Approve an initiated recovery before the wait time ends.
    ///
    /// # Errors
    ///
    /// - [`EmergencyError::Forbidden`] unless the caller is the grantor.
    /// - [`EmergencyError::InvalidTransition`] unless recovery is initiated.
    pub async fn approve(&self, grantor_id: Uuid, grant_id: Uuid) -> Result<EmergencyAccess, EmergencyError> {
        let mut grant = self.as_grantor(grantor_id, grant_id).await?;
        transition(&mut grant, EmergencyAction::Approve)?;
        self.save(&grant).await?;
        info!(grant_id = %grant_id, "emergency recovery approved by grantor");
        Ok(grant)
    }

    /// Refuse an initiated or approved recovery; the grant returns to
    /// confirmed.
    ///
    /// # Errors
    ///
    /// - [`EmergencyError::Forbidden`] unless the caller is the grantor.
    /// - [`EmergencyError::InvalidTransition`] if no recovery is under way.
    pub async fn reject(&self, grantor_id: Uuid, grant_id: Uuid) -> Result<EmergencyAccess, EmergencyError> {
        let mut grant = self.as_grantor(grantor_id, grant_id).await?;
        transition(&mut grant, EmergencyAction::Reject)?;
        grant.recovery_initiated_at = None;
        grant.last_notification_at = None;
        self.save(&grant).await?;
        info!(grant_id = %grant_id, "emergency recovery rejected");
        Ok(grant)
    }

    // ── Grantee side ──────────────────────────────────────────────────

    /// Grants naming the user as contact, pending invitations included.
    ///
    /// # Errors
    ///
    /// Returns [`EmergencyError::Barrier`] if storage fails.
    pub async fn trusted_by(&self, grantee: &User) -> Result<Vec<EmergencyAccess>, EmergencyError> {
        let mut grants = self.indexed(&format!("{GRANTEE_PREFIX}{}/", grantee.id)).await?;
        let invites = format!("{INVITE_PREFIX}{}/", self.barrier.blind_index(&grantee.email));
        grants.extend(self.indexed(&invites).await?);
        Ok(grants)
    }

    /// Accept an invitation addressed to the user's e-mail.
    ///
    /// # Errors
    ///
    /// - [`EmergencyError::Forbidden`] if the invitation is for another address.
    /// - [`EmergencyError::InvalidTransition`] if it was already accepted.
    pub async fn accept(&self, grantee: &User, grant_id: Uuid) -> Result<EmergencyAccess, EmergencyError> {
        let mut grant = self.load(grant_id).await?;
        if grant.grantee_email != grantee.email {
            return Err(EmergencyError::Forbidden {
                reason: "invitation was sent to a different e-mail address".to_owned(),
            });
        }
        if grant.grantor_id == grantee.id {
            return Err(EmergencyError::InvalidInput {
                reason: "cannot accept your own grant".to_owned(),
            });
        }
        transition(&mut grant, EmergencyAction::Accept)?;
        self.barrier.delete(&self.invite_key(&grant)).await?;
        grant.grantee_id = Some(grantee.id);
        self.save(&grant).await?;
        self.barrier
            .put_json(&format!("{GRANTEE_PREFIX}{}/{}", grantee.id, grant.id), &true)
            .await?;
        info!(grant_id = %grant_id, grantee_id = %grantee.id, "emergency invitation accepted");
        Ok(grant)
    }

    /// Start the recovery clock.
    ///
    /// # Errors
    ///
    /// - [`EmergencyError::Forbidden`] unless the caller is the grantee.
    /// - [`EmergencyError::InvalidTransition`] unless the grant is confirmed.
    pub async fn initiate(&self, grantee_id: Uuid, grant_id: Uuid) -> Result<EmergencyAccess, EmergencyError> {
        let mut grant = self.as_grantee(grantee_id, grant_id).await?;
        transition(&mut grant, EmergencyAction::Initiate)?;
        grant.recovery_initiated_at = Some(grant.updated_at);
        grant.last_notification_at = None;
        self.save(&grant).await?;
        info!(grant_id = %grant_id, wait_days = grant.wait_days, "emergency recovery initiated");
        Ok(grant)
    }

    /// The grantor's personal vault, for an approved view grant.
    ///
    /// # Errors
    ///
    /// - [`EmergencyError::Forbidden`] unless the caller is the grantee of an
    ///   approved view grant.
    pub async fn view(&self, grantee_id: Uuid, grant_id: Uuid) -> Result<Vec<CipherView>, EmergencyError> {
        let grant = self.approved(grantee_id, grant_id, EmergencyKind::View).await?;
        let ciphers = self
            .vault
            .personal_ciphers(grant.grantor_id)
            .await
            .map_err(vault_error)?;
        Ok(ciphers
            .iter()
            .filter(|c| c.deleted_at.is_none())
            .map(|c| CipherView::new(c, grantee_id, CipherAccess::READ_ONLY))
            .collect())
    }

    /// Key material for an approved takeover.
    ///
    /// # Errors
    ///
    /// - [`EmergencyError::Forbidden`] unless the caller is the grantee of an
    ///   approved takeover grant.
    pub async fn takeover(&self, grantee_id: Uuid, grant_id: Uuid) -> Result<TakeoverMaterial, EmergencyError> {
        let grant = self.approved(grantee_id, grant_id, EmergencyKind::Takeover).await?;
        let grantor = self.grantor(&grant).await?;
        let key_encrypted = grant.key_encrypted.ok_or_else(|| EmergencyError::InvalidInput {
            reason: "grant has no key".to_owned(),
        })?;
        Ok(TakeoverMaterial {
            kdf: grantor.kdf,
            key_encrypted,
        })
    }

    /// Set a new master password on the grantor's account. Every session of
    /// the grantor ends.
    ///
    /// # Errors
    ///
    /// - [`EmergencyError::Forbidden`] unless the caller is the grantee of an
    ///   approved takeover grant.
    /// - [`EmergencyError::InvalidInput`] for an empty hash or key.
    pub async fn takeover_password(
        &self,
        grantee_id: Uuid,
        grant_id: Uuid,
        new_master_password_hash: &str,
        new_key: String,
    ) -> Result<(), EmergencyError> {
        let grant = self.approved(grantee_id, grant_id, EmergencyKind::Takeover).await?;
        let mut grantor = self.grantor(&grant).await?;
        self.users
            .set_password(&mut grantor, new_master_password_hash, new_key, None)
            .await
            .map_err(account_error)?;
        self.refresh
            .revoke(grantor.id, None)
            .await
            .map_err(account_error)?;
        info!(grant_id = %grant_id, grantor_id = %grantor.id, "emergency takeover reset master password");
        Ok(())
    }

    // ── Either party ──────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`EmergencyError::NotFound`] unless the caller is a party.
    pub async fn get(&self, user_id: Uuid, grant_id: Uuid) -> Result<EmergencyAccess, EmergencyError> {
        let grant = self.load(grant_id).await?;
        if grant.involves(user_id) {
            Ok(grant)
        } else {
            Err(EmergencyError::NotFound { id: grant_id })
        }
    }

    /// Revoke a grant from any status.
    ///
    /// # Errors
    ///
    /// Returns [`EmergencyError::NotFound`] unless the caller is a party.
    pub async fn delete(&self, user_id: Uuid, grant_id: Uuid) -> Result<(), EmergencyError> {
        let grant = self.get(user_id, grant_id).await?;
        self.remove(&grant).await?;
        info!(grant_id = %grant_id, user_id = %user_id, "emergency access removed");
        Ok(())
    }

    // ── Maintenance ───────────────────────────────────────────────────

    /// Approve every initiated recovery whose wait time has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`EmergencyError::Barrier`] if storage fails.
    pub async fn auto_approve_due(&self, now: DateTime<Utc>) -> Result<Vec<EmergencyAccess>, EmergencyError> {
        let mut approved = Vec::new();
        for mut grant in self.all().await? {
            if grant.status != EmergencyStatus::RecoveryInitiated || grant.auto_approve_at().is_none_or(|at| at > now) {
                continue;
            }
            grant.status = EmergencyStatus::RecoveryApproved;
            grant.updated_at = now;
            self.save(&grant).await?;
            info!(grant_id = %grant.id, "emergency recovery auto-approved after wait time");
            approved.push(grant);
        }
        Ok(approved)
    }

    /// Remind grantors of pending recoveries, at most once a day each.
    /// Returns the grants reminded about.
    ///
    /// # Errors
    ///
    /// Returns [`EmergencyError::Barrier`] if storage fails.
    pub async fn send_reminders(&self, now: DateTime<Utc>) -> Result<Vec<EmergencyAccess>, EmergencyError> {
        let interval = Duration::hours(REMINDER_INTERVAL_HOURS);
        let mut reminded = Vec::new();
        for mut grant in self.all().await? {
            if grant.status != EmergencyStatus::RecoveryInitiated {
                continue;
            }
            if grant.last_notification_at.is_some_and(|at| at + interval > now) {
                continue;
            }
            grant.last_notification_at = Some(now);
            self.save(&grant).await?;
            info!(
                grant_id = %grant.id,
                grantor_id = %grant.grantor_id,
                auto_approve_at = ?grant.auto_approve_at(),
                "emergency recovery reminder due"
            );
            reminded.push(grant);
        }
        Ok(reminded)
    }

    /// Drop invitations nobody accepted within `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`EmergencyError::Barrier`] if storage fails.
    pub async fn expire_invitations(&self, now: DateTime<Utc>, ttl: Duration) -> Result<usize, EmergencyError> {
        let mut expired = 0usize;
        for grant in self.all().await? {
            if grant.status == EmergencyStatus::Invited && grant.created_at + ttl <= now {
                self.remove(&grant).await?;
                expired = expired.saturating_add(1);
            }
        }
        Ok(expired)
    }

    /// Remove every grant a user gave or holds, including pending
    /// invitations to their address.
    ///
    /// # Errors
    ///
    /// Returns [`EmergencyError::Barrier`] if storage fails.
    pub async fn purge_for_user(&self, user: &User) -> Result<usize, EmergencyError> {
        let mut grants = self.granted_by(user.id).await?;
        grants.extend(self.trusted_by(user).await?);
        for grant in &grants {
            self.remove(grant).await?;
        }
        Ok(grants.len())
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn load(&self, grant_id: Uuid) -> Result<EmergencyAccess, EmergencyError> {
        self.barrier
            .get_json(&format!("{GRANT_PREFIX}{grant_id}"))
            .await?
            .ok_or(EmergencyError::NotFound { id: grant_id })
    }

    async fn as_grantor(&self, user_id: Uuid, grant_id: Uuid) -> Result<EmergencyAccess, EmergencyError> {
        let grant = self.get(user_id, grant_id).await?;
        if grant.grantor_id == user_id {
            Ok(grant)
        } else {
            Err(EmergencyError::Forbidden {
                reason: "only the grantor may do this".to_owned(),
            })
        }
    }

    async fn as_grantee(&self, user_id: Uuid, grant_id: Uuid) -> Result<EmergencyAccess, EmergencyError> {
        let grant = self.get(user_id, grant_id).await?;
        if grant.grantee_id == Some(user_id) {
            Ok(grant)
        } else {
            Err(EmergencyError::Forbidden {
                reason: "only the grantee may do this".to_owned(),
            })
        }
    }

    async fn approved(&self, grantee_id: Uuid, grant_id: Uuid, kind: EmergencyKind) -> Result<EmergencyAccess, EmergencyError> {
        let grant = self.as_grantee(grantee_id, grant_id).await?;
        if grant.kind != kind {
            return Err(EmergencyError::Forbidden {
                reason: "grant does not allow this kind of access".to_owned(),
            });
        }
        if grant.status != EmergencyStatus::RecoveryApproved {
            return Err(EmergencyError::Forbidden {
                reason: "recovery has not been approved".to_owned(),
            });
        }
        Ok(grant)
    }

    async fn grantor(&self, grant: &EmergencyAccess) -> Result<User, EmergencyError> {
        self.users
            .get(grant.grantor_id)
            .await
            .map_err(account_error)?
            .ok_or(EmergencyError::NotFound { id: grant.id })
    }

    async fn all(&self) -> Result<Vec<EmergencyAccess>, EmergencyError> {
        Ok(self.barrier.values_json(GRANT_PREFIX).await?)
    }

    async fn indexed(&self, prefix: &str) -> Result<Vec<EmergencyAccess>, EmergencyError> {
        let mut grants = Vec::new();
        for key in self.barrier.list(prefix).await? {
            let Some(id) = key.strip_prefix(prefix).and_then(|id| Uuid::parse_str(id).ok()) else {
                continue;
            };
            if let Some(grant) = self.barrier.get_json(&format!("{GRANT_PREFIX}{id}")).await? {
                grants.push(grant);
            }
        }
        Ok(grants)
    }

    fn invite_key(&self, grant: &EmergencyAccess) -> String {
        format!(
            "{INVITE_PREFIX}{}/{}",
            self.barrier.blind_index(&grant.grantee_email),
            grant.id
        )
    }

    async fn save(&self, grant: &EmergencyAccess) -> Result<(), EmergencyError> {
        self.barrier
            .put_json(&format!("{GRANT_PREFIX}{}", grant.id), grant)
            .await?;
        Ok(())
    }

    async fn remove(&self, grant: &EmergencyAccess) -> Result<(), EmergencyError> {
        self.barrier
            .delete(&format!("{GRANTOR_PREFIX}{}/{}", grant.grantor_id, grant.id))
            .await?;
        if let Some(grantee_id) = grant.grantee_id {
            self.barrier
                .delete(&format!("{GRANTEE_PREFIX}{grantee_id}/{}", grant.id))
                .await?;
        }
        self.barrier.delete(&self.invite_key(grant)).await?;
        self.barrier.delete(&format!("{GRANT_PREFIX}{}", grant.id)).await?;
        Ok(())
    }
}

fn transition(grant: &mut EmergencyAccess, action: EmergencyAction) -> Result<(), EmergencyError> {
    let next = next_status(grant.status, action).ok_or(EmergencyError::InvalidTransition {
        status: grant.status.as_str(),
        action: action.as_str(),
    })?;
    grant.status = next;
    grant.updated_at = Utc::now();
    Ok(())
}

fn account_error(e: AccountError) -> EmergencyError {
    match e {
        AccountError::Barrier(e) => EmergencyError::Barrier(e),
        AccountError::Crypto(e) => EmergencyError::Crypto(e),
        other => EmergencyError::InvalidInput {
            reason: other.to_string(),
        },
    }
}

fn vault_error(e: VaultError) -> EmergencyError {
    match e {
        VaultError::Barrier(e) => EmergencyError::Barrier(e),
        other => EmergencyError::InvalidInput {
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::auth::{AuthService, JwtKeys, LockoutRule, LoginRequest};
    use crate::error::BarrierError;
    use crate::user::tests::{barrier, flaky_barrier, registration};
    use crate::vault::{CipherType, NewCipher};

    struct Fixture {
        service: EmergencyService,
        auth: AuthService,
        vault: VaultService,
        grantor: User,
        grantee: User,
    }

    async fn fixture() -> Fixture {
        fixture_on(barrier()).await
    }

    async fn fixture_on(barrier: Arc<Barrier>) -> Fixture {
        let keys = Arc::new(JwtKeys::new(&[9u8; 32]).unwrap());
        let auth = AuthService::new("main", Arc::clone(&barrier), keys);
        let grantor = auth.register(registration("grantor@example.com")).await.unwrap();
        let grantee = auth.register(registration("grantee@example.com")).await.unwrap();
        Fixture {
            service: EmergencyService::new(Arc::clone(&barrier)),
            vault: VaultService::new(barrier),
            auth,
            grantor,
            grantee,
        }
    }

    fn invite(kind: EmergencyKind) -> EmergencyInvite {
        EmergencyInvite {
            email: "Grantee@Example.com".to_owned(),
            kind,
            wait_days: 7,
        }
    }

    impl Fixture {
        async fn confirmed(&self, kind: EmergencyKind) -> EmergencyAccess {
            let grant = self.service.invite(&self.grantor, invite(kind), true).await.unwrap();
            self.service.accept(&self.grantee, grant.id).await.unwrap();
            self.service
                .confirm(self.grantor.id, grant.id, "4.key-for-grantee".to_owned())
                .await
                .unwrap()
        }
    }

    #[test]
    fn transition_table() {
        use EmergencyAction as A;
        use EmergencyStatus as S;
        assert_eq!(next_status(S::Invited, A::Accept), Some(S::Accepted));
        assert_eq!(next_status(S::Accepted, A::Confirm), Some(S::Confirmed));
        assert_eq!(next_status(S::Confirmed, A::Initiate), Some(S::RecoveryInitiated));
        assert_eq!(next_status(S::RecoveryInitiated, A::Approve), Some(S::RecoveryApproved));
        assert_eq!(next_status(S::RecoveryApproved, A::Reject), Some(S::Confirmed));
        assert_eq!(next_status(S::Invited, A::Confirm), None);
        assert_eq!(next_status(S::Confirmed, A::Approve), None);
        assert_eq!(next_status(S::RecoveryApproved, A::Initiate), None);
    }

    #[tokio::test]
    async fn invite_rules() {
        let f = fixture().await;
        assert!(matches!(
            f.service.invite(&f.grantor, invite(EmergencyKind::View), false).await,
            Err(EmergencyError::NotEntitled)
        ));

        let mut to_self = invite(EmergencyKind::View);
        to_self.email = "grantor@example.com".to_owned();
        assert!(matches!(
            f.service.invite(&f.grantor, to_self, true).await,
            Err(EmergencyError::InvalidInput { .. })
        ));

        let mut too_long = invite(EmergencyKind::View);
        too_long.wait_days = 91;
        assert!(f.service.invite(&f.grantor, too_long, true).await.is_err());

        f.service.invite(&f.grantor, invite(EmergencyKind::View), true).await.unwrap();
        assert!(matches!(
            f.service.invite(&f.grantor, invite(EmergencyKind::Takeover), true).await,
            Err(EmergencyError::Duplicate)
        ));
    }

    #[tokio::test]
    async fn accept_requires_matching_email() {
        let f = fixture().await;
        let grant = f.service.invite(&f.grantor, invite(EmergencyKind::View), true).await.unwrap();
        assert_eq!(f.service.trusted_by(&f.grantee).await.unwrap().len(), 1);

        let stranger = f.auth.register(registration("stranger@example.com")).await.unwrap();
        assert!(matches!(
            f.service.accept(&stranger, grant.id).await,
            Err(EmergencyError::Forbidden { .. })
        ));

        let accepted = f.service.accept(&f.grantee, grant.id).await.unwrap();
        assert_eq!(accepted.status, EmergencyStatus::Accepted);
        assert_eq!(accepted.grantee_id, Some(f.grantee.id));
        assert!(matches!(
            f.service.accept(&f.grantee, grant.id).await,
            Err(EmergencyError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn only_the_right_party_moves_the_grant() {
        let f = fixture().await;
        let grant = f.confirmed(EmergencyKind::View).await;

        assert!(matches!(
            f.service.initiate(f.grantor.id, grant.id).await,
            Err(EmergencyError::Forbidden { .. })
        ));
        f.service.initiate(f.grantee.id, grant.id).await.unwrap();
        assert!(matches!(
            f.service.approve(f.grantee.id, grant.id).await,
            Err(EmergencyError::Forbidden { .. })
        ));
        let rejected = f.service.reject(f.grantor.id, grant.id).await.unwrap();
        assert_eq!(rejected.status, EmergencyStatus::Confirmed);
        assert!(rejected.recovery_initiated_at.is_none());
    }

    #[tokio::test]
    async fn view_after_approval_hides_trash() {
        let f = fixture().await;
        let grant = f.confirmed(EmergencyKind::View).await;
        let new = |n: u8| NewCipher {
            kind: CipherType::Login,
            data: json!({ "n": n }),
            folder_id: None,
            favorite: false,
            reprompt: false,
            team_id: None,
            collection_ids: Vec::new(),
        };
        f.vault.create(f.grantor.id, new(1)).await.unwrap();
        let trashed = f.vault.create(f.grantor.id, new(2)).await.unwrap();
        f.vault.trash(f.grantor.id, trashed.id).await.unwrap();

        f.service.initiate(f.grantee.id, grant.id).await.unwrap();
        assert!(f.service.view(f.grantee.id, grant.id).await.is_err());

        f.service.approve(f.grantor.id, grant.id).await.unwrap();
        let ciphers = f.service.view(f.grantee.id, grant.id).await.unwrap();
        assert_eq!(ciphers.len(), 1);
        assert!(!ciphers[0].edit);
        assert!(matches!(
            f.service.takeover(f.grantee.id, grant.id).await,
            Err(EmergencyError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn view_surfaces_storage_failure_as_barrier_error() {
        let (backend, barrier) = flaky_barrier();
        let f = fixture_on(barrier).await;
        let grant = f.confirmed(EmergencyKind::View).await;
        f.service.initiate(f.grantee.id, grant.id).await.unwrap();
        f.service.approve(f.grantor.id, grant.id).await.unwrap();

        backend.fail_reads_under("user-ciphers/");
        assert!(matches!(
            f.service.view(f.grantee.id, grant.id).await,
            Err(EmergencyError::Barrier(BarrierError::Storage(_)))
        ));
    }

    #[tokio::test]
    async fn auto_approve_after_wait_and_daily_reminders() {
        let f = fixture().await;
        let grant = f.confirmed(EmergencyKind::Takeover).await;
        let initiated = f.service.initiate(f.grantee.id, grant.id).await.unwrap();
        let start = initiated.recovery_initiated_at.unwrap();

        assert_eq!(f.service.send_reminders(start).await.unwrap().len(), 1);
        assert!(f.service.send_reminders(start + Duration::hours(1)).await.unwrap().is_empty());
        assert_eq!(f.service.send_reminders(start + Duration::hours(25)).await.unwrap().len(), 1);

        assert!(f.service.auto_approve_due(start + Duration::days(6)).await.unwrap().is_empty());
        let approved = f.service.auto_approve_due(start + Duration::days(7)).await.unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].status, EmergencyStatus::RecoveryApproved);
        assert!(f.service.send_reminders(start + Duration::days(8)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn takeover_resets_grantor_password_and_sessions() {
        let f = fixture().await;
        let grant = f.confirmed(EmergencyKind::Takeover).await;
        let login = LoginRequest {
            email: "grantor@example.com".to_owned(),
            master_password_hash: "client-hash".to_owned(),
            device: "phone".to_owned(),
        };
        let (_, tokens) = f.auth.login(&login, LockoutRule::default()).await.unwrap();

        f.service.initiate(f.grantee.id, grant.id).await.unwrap();
        f.service.approve(f.grantor.id, grant.id).await.unwrap();

        let material = f.service.takeover(f.grantee.id, grant.id).await.unwrap();
        assert_eq!(material.key_encrypted, "4.key-for-grantee");

        f.service
            .takeover_password(f.grantee.id, grant.id, "new-hash", "2.new-key".to_owned())
            .await
            .unwrap();
        assert!(f.auth.refresh(&tokens.refresh_token).await.is_err());
        assert!(matches!(
            f.auth.login(&login, LockoutRule::default()).await,
            Err(AccountError::InvalidCredentials)
        ));
        let relogin = LoginRequest {
            master_password_hash: "new-hash".to_owned(),
            ..login
        };
        assert!(f.auth.login(&relogin, LockoutRule::default()).await.is_ok());
    }

    #[tokio::test]
    async fn either_party_deletes_and_invites_expire() {
        let f = fixture().await;
        let grant = f.confirmed(EmergencyKind::View).await;
        f.service.delete(f.grantee.id, grant.id).await.unwrap();
        assert!(f.service.granted_by(f.grantor.id).await.unwrap().is_empty());

        let pending = f.service.invite(&f.grantor, invite(EmergencyKind::View), true).await.unwrap();
        let later = pending.created_at + Duration::days(8);
        assert_eq!(f.service.expire_invitations(later, Duration::days(7)).await.unwrap(), 1);
        assert!(f.service.trusted_by(&f.grantee).await.unwrap().is_empty());
    }
}
