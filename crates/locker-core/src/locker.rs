//! The service set of one tenant database.
//!
//! A [`Locker`] owns the barrier for its tenant and every service built on
//! it. Operations that cross subsystems (login with team lockout policies,
//! plan entitlements, account and team deletion, sync) live here so the
//! individual services stay independent of each other.

use std::sync::Arc;

use locker_storage::StorageBackend;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{AuthService, JwtKeys, LockoutRule, LoginRequest, TokenPair};
use crate::barrier::Barrier;
use crate::billing::{
    BillingService, Payment, PaymentGateway, Plan, Subscriber, Subscription, UpgradeRequest,
};
use crate::crypto::{self, EncryptionKey};
use crate::emergency::{EmergencyAccess, EmergencyInvite, EmergencyService};
use crate::error::{AccountError, BarrierError, LockerError, TeamError};
use crate::event::{ActivityEvent, EventKind, EventLog, EventSink};
use crate::jobs::Scheduler;
use crate::relay::{NewAlias, RelayAlias, RelayService};
use crate::team::{Collection, MemberStatus, Policy, TeamRole, TeamService};
use crate::tenant::validate_alias;
use crate::user::{Profile, User, UserStore};
use crate::vault::{CipherView, Folder, VaultService};

/// Deployment-wide settings shared by every tenant.
#[derive(Clone)]
pub struct LockerSettings {
    pub relay_domain: String,
    /// Sinks that receive every event in addition to the store.
    pub event_sinks: Vec<Arc<dyn EventSink>>,
}

impl Default for LockerSettings {
    fn default() -> Self {
        Self {
            relay_domain: "relay.locker.local".to_owned(),
            event_sinks: Vec::new(),
        }
    }
}

/// A team as listed in a member's sync.
#[derive(Debug, Clone, Serialize)]
pub struct Membership {
    pub team_id: Uuid,
    pub member_id: Uuid,
    pub name: String,
    pub role: TeamRole,
    pub status: MemberStatus,
    /// Team key encrypted to the member; present once confirmed.
    pub key: Option<String>,
    pub plan: Plan,
    pub seats: u32,
}

/// Everything a client needs to rebuild its local vault.
#[derive(Debug, Clone, Serialize)]
pub struct SyncData {
    pub profile: Profile,
    pub folders: Vec<Folder>,
    pub ciphers: Vec<CipherView>,
    pub collections: Vec<Collection>,
    pub teams: Vec<Membership>,
    pub policies: Vec<Policy>,
    pub premium: bool,
}

pub struct Locker {
    alias: String,
    pub auth: AuthService,
    pub users: UserStore,
    pub vault: VaultService,
    pub teams: TeamService,
    pub emergency: EmergencyService,
    pub billing: BillingService,
    pub relay: RelayService,
    pub events: EventLog,
}

impl Locker {
    /// Open the services of tenant `alias`. The barrier key is derived from
    /// the deployment master key and the alias, so tenants never share a
    /// data key.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Codec`] if the alias is invalid.
    /// - [`BarrierError::Crypto`] if key derivation fails.
    pub fn open(
        alias: &str,
        storage: Arc<dyn StorageBackend>,
        master_key: &EncryptionKey,
        jwt: Arc<JwtKeys>,
        gateway: Arc<dyn PaymentGateway>,
        settings: &LockerSettings,
    ) -> Result<Self, BarrierError> {
        validate_alias(alias).map_err(|e| BarrierError::Codec {
            key: alias.to_owned(),
            reason: e.to_string(),
        })?;
        let key = crypto::derive_key(master_key, &format!("locker-tenant:{alias}"))?;
        let barrier = Arc::new(Barrier::new(storage, &key)?);

        let events = settings
            .event_sinks
            .iter()
            .fold(EventLog::new(Arc::clone(&barrier)), |log, sink| {
                log.with_sink(Arc::clone(sink))
            });

        Ok(Self {
            alias: alias.to_owned(),
            auth: AuthService::new(alias, Arc::clone(&barrier), jwt),
            users: UserStore::new(Arc::clone(&barrier)),
            vault: VaultService::new(Arc::clone(&barrier)),
            teams: TeamService::new(Arc::clone(&barrier)),
            emergency: EmergencyService::new(Arc::clone(&barrier)),
            billing: BillingService::new(Arc::clone(&barrier), gateway),
            relay: RelayService::new(Arc::clone(&barrier), &settings.relay_domain),
            events,
        })
    }

    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            emergency: self.emergency.clone(),
            vault: self.vault.clone(),
            billing: self.billing.clone(),
            teams: self.teams.clone(),
            refresh: self.auth.refresh_tokens().clone(),
            events: self.events.clone(),
        }
    }

    /// Log in, applying the strictest block-failed-logins policy of the
    /// user's teams.
    ///
    /// # Errors
    ///
    /// See [`AuthService::login`].
    pub async fn login(&self, request: &LoginRequest) -> Result<(User, TokenPair), AccountError> {
        let known = self.users.find_by_email(&request.email).await?;
        let rule = match &known {
            Some(user) => self.lockout_rule(user.id).await?,
            None => LockoutRule::default(),
        };

        match self.auth.login(request, rule).await {
            Ok((user, tokens)) => {
                self.events
                    .record(ActivityEvent::new(EventKind::LoginSucceeded).actor(user.id))
                    .await;
                Ok((user, tokens))
            }
            Err(e) => {
                if let Some(user) = &known {
                    self.events
                        .record(ActivityEvent::new(EventKind::LoginFailed).user(user.id))
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Whether the user gets premium features, through their own plan or a
    /// paid team they are a confirmed member of.
    ///
    /// # Errors
    ///
    /// Returns [`LockerError`] if storage fails.
    pub async fn premium_access(&self, user_id: Uuid) -> Result<bool, LockerError> {
        let subscriptions = self.billing.subscriptions();
        if subscriptions.plan(Subscriber::User(user_id)).await?.premium_features() {
            return Ok(true);
        }
        for (team, member) in self.teams.teams_for_user(user_id).await? {
            if member.status == MemberStatus::Confirmed
                && subscriptions.plan(Subscriber::Team(team.id)).await?.premium_features()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Invite an emergency contact, checking the grantor's entitlement.
    ///
    /// # Errors
    ///
    /// See [`EmergencyService::invite`].
    pub async fn invite_emergency_contact(&self, grantor: &User, invite: EmergencyInvite) -> Result<EmergencyAccess, LockerError> {
        let premium = self.premium_access(grantor.id).await?;
        let grant = self.emergency.invite(grantor, invite, premium).await?;
        self.events
            .record(
                ActivityEvent::new(EventKind::EmergencyInvited)
                    .actor(grantor.id)
                    .target(grant.id),
            )
            .await;
        Ok(grant)
    }

    /// Create a relay alias, checking the owner's entitlement.
    ///
    /// # Errors
    ///
    /// See [`RelayService::create`].
    pub async fn create_relay_alias(&self, user_id: Uuid, new: NewAlias) -> Result<RelayAlias, LockerError> {
        let premium = self.premium_access(user_id).await?;
        let alias = self.relay.create(user_id, new, premium).await?;
        self.events
            .record(
                ActivityEvent::new(EventKind::RelayAliasCreated)
                    .actor(user_id)
                    .target(alias.id),
            )
            .await;
        Ok(alias)
    }

    /// Buy a plan for a user or a team. A paid purchase applies at once; a
    /// pending one applies at [`Locker::confirm_payment`]. The caller checks
    /// that the actor may bill the subscriber.
    ///
    /// # Errors
    ///
    /// See [`BillingService::upgrade`].
    pub async fn purchase_plan(&self, actor_id: Uuid, subscriber: Subscriber, request: UpgradeRequest) -> Result<Payment, LockerError> {
        let payment = self.billing.upgrade(subscriber, request).await?;
        self.events
            .record(subscriber_event(EventKind::SubscriptionUpgraded, subscriber).actor(actor_id).target(payment.id))
            .await;
        Ok(payment)
    }

    /// Operator confirmation of a pending payment.
    ///
    /// # Errors
    ///
    /// See [`BillingService::confirm_payment`].
    pub async fn confirm_payment(&self, payment_id: Uuid) -> Result<Subscription, LockerError> {
        let subscription = self.billing.confirm_payment(payment_id).await?;
        self.events
            .record(subscriber_event(EventKind::PaymentConfirmed, subscription.subscriber).target(payment_id))
            .await;
        Ok(subscription)
    }

    /// Operator rejection of a pending payment.
    ///
    /// # Errors
    ///
    /// See [`BillingService::reject_payment`].
    pub async fn reject_payment(&self, payment_id: Uuid, reason: &str) -> Result<Payment, LockerError> {
        let payment = self.billing.reject_payment(payment_id, reason).await?;
        self.events
            .record(subscriber_event(EventKind::PaymentRejected, payment.subscriber).target(payment_id))
            .await;
        Ok(payment)
    }

    /// Delete an account and everything that belongs to it.
    ///
    /// # Errors
    ///
    /// - [`AccountError::InvalidCredentials`] if the password hash is wrong.
    /// - [`AccountError::SoleOwner`] while the user is the only owner of a team.
    pub async fn delete_account(&self, user: &User, master_password_hash: &str) -> Result<(), LockerError> {
        self.auth.verify_master_password(user, master_password_hash)?;
        if let Some(team_id) = self.teams.sole_owned_teams(user.id).await?.first() {
            return Err(AccountError::SoleOwner { team_id: *team_id }.into());
        }

        let ciphers = self.vault.purge_user(user.id).await?;
        self.teams.forget_user(user).await?;
        let grants = self.emergency.purge_for_user(user).await?;
        let aliases = self.relay.delete_all_for(user.id).await?;
        self.billing.forget(Subscriber::User(user.id)).await?;
        self.auth.refresh_tokens().revoke(user.id, None).await?;
        self.events.store().purge_user(user.id).await?;
        self.users.delete(user).await?;
        self.events
            .record_external(&ActivityEvent::new(EventKind::AccountDeleted).actor(user.id))
            .await;

        info!(user_id = %user.id, ciphers, grants, aliases, "account data removed");
        Ok(())
    }

    /// Delete a team with its ciphers, subscription and event feed.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Forbidden`] unless the actor is an owner.
    pub async fn delete_team(&self, actor_id: Uuid, team_id: Uuid) -> Result<(), LockerError> {
        let former = self.teams.delete(actor_id, team_id).await?;
        let ciphers = self.vault.purge_team(team_id).await?;
        self.billing.forget(Subscriber::Team(team_id)).await?;
        self.events.store().purge_team(team_id).await?;
        self.users.touch(&former).await?;
        self.events
            .record(ActivityEvent::new(EventKind::TeamDeleted).actor(actor_id).target(team_id))
            .await;
        info!(team_id = %team_id, ciphers, "team data removed");
        Ok(())
    }

    /// Delete a collection and drop it from every team cipher.
    ///
    /// # Errors
    ///
    /// See [`TeamService::delete_collection`].
    pub async fn delete_collection(&self, actor_id: Uuid, team_id: Uuid, collection_id: Uuid) -> Result<(), LockerError> {
        self.teams.delete_collection(actor_id, team_id, collection_id).await?;
        self.vault.forget_collection(team_id, collection_id).await?;
        let members = self.teams.confirmed_user_ids(team_id).await?;
        self.users.touch(&members).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`LockerError`] if any subsystem fails to read.
    pub async fn sync(&self, user: &User) -> Result<SyncData, LockerError> {
        let mut teams = Vec::new();
        let mut collections = Vec::new();
        for (team, member) in self.teams.teams_for_user(user.id).await? {
            if member.status == MemberStatus::Confirmed {
                collections.extend(self.teams.collections_for(&member).await?);
            }
            teams.push(Membership {
                team_id: team.id,
                member_id: member.id,
                name: team.name,
                role: member.role,
                status: member.status,
                key: member.key,
                plan: self.billing.subscriptions().plan(Subscriber::Team(team.id)).await?,
                seats: team.seats,
            });
        }

        Ok(SyncData {
            profile: Profile::from(user),
            folders: self.vault.folders(user.id).await?,
            ciphers: self.vault.list(user.id).await?,
            collections,
            teams,
            policies: self.teams.policies_for_user(user.id).await?,
            premium: self.premium_access(user.id).await?,
        })
    }

    async fn lockout_rule(&self, user_id: Uuid) -> Result<LockoutRule, AccountError> {
        match self.teams.lockout_rule(user_id).await {
            Ok(rule) => Ok(rule),
            Err(TeamError::Barrier(e)) => Err(AccountError::Barrier(e)),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "ignoring unreadable lockout policy");
                Ok(LockoutRule::default())
            }
        }
    }
}

/// An event about a subscriber's billing, attributed to the user or team.
pub(crate) fn subscriber_event(kind: EventKind, subscriber: Subscriber) -> ActivityEvent {
    match subscriber {
        Subscriber::User(id) => ActivityEvent::new(kind).user(id),
        Subscriber::Team(id) => ActivityEvent::new(kind).team(id),
    }
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker").field("alias", &self.alias).finish_non_exhaustive()
    }
}
