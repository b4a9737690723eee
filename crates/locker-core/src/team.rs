//! Teams: membership, collections, and policies.
//!
//! Storage layout:
//!
//! - `teams/{team_id}`: the [`Team`] record.
//! - `team-members/{team_id}/{member_id}`: a [`Member`].
//! - `user-teams/{user_id}/{team_id}`: member id, once an invitation is accepted.
//! - `team-invites/{email_index}/{team_id}`: member id, while invited.
//! - `collections/{team_id}/{collection_id}`: a [`Collection`].
//! - `policies/{team_id}/{kind}`: a [`Policy`].
//!
//! Collection grants live on the member record, so resolving a member's
//! access never needs more than one read.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::LockoutRule;
use crate::barrier::Barrier;
use crate::billing::Plan;
use crate::error::TeamError;
use crate::permission::{self, TeamAction};
use crate::user::{User, normalize_email};

const TEAM_PREFIX: &str = "teams/";
const MEMBER_PREFIX: &str = "team-members/";
const USER_TEAMS_PREFIX: &str = "user-teams/";
const INVITE_PREFIX: &str = "team-invites/";
const COLLECTION_PREFIX: &str = "collections/";
const POLICY_PREFIX: &str = "policies/";

/// Role of a member within a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Owner,
    Admin,
    Manager,
    Member,
}

/// Membership lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Invitation sent, not yet accepted.
    Invited,
    /// Accepted by the invitee; waiting for an admin to share the team key.
    Accepted,
    /// Holds the team key and may see team data.
    Confirmed,
}

/// Access a member has to one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionGrant {
    pub collection_id: Uuid,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub hide_passwords: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub billing_email: String,
    /// Seats paid for. Every member, in any status, occupies one. Lowering
    /// the count never removes members: a team over its limit keeps them and
    /// refuses new invitations until seats are bought.
    pub seats: u32,
    pub created_at: DateTime<Utc>,
    pub revision_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub team_id: Uuid,
    /// Set once the invitation is accepted.
    pub user_id: Option<Uuid>,
    pub email: String,
    pub role: TeamRole,
    pub status: MemberStatus,
    /// Team key encrypted to the member's public key, set at confirm.
    pub key: Option<String>,
    #[serde(default)]
    pub grants: Vec<CollectionGrant>,
    pub invited_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: Uuid,
    pub team_id: Uuid,
    /// Encrypted under the team key.
    pub name: String,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub revision_date: DateTime<Utc>,
}

/// Team policy kinds. The server enforces `BlockFailedLogins` at login; the
/// others are stored and synced for clients to enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Complexity rules for generated passwords.
    PasswordGenerator,
    /// Minimum strength and length of master passwords.
    MasterPassword,
    /// Lock accounts after repeated failed logins.
    BlockFailedLogins,
    /// Forbid exporting the personal vault.
    DisablePersonalVaultExport,
}

impl PolicyKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PasswordGenerator => "password_generator",
            Self::MasterPassword => "master_password",
            Self::BlockFailedLogins => "block_failed_logins",
            Self::DisablePersonalVaultExport => "disable_personal_vault_export",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub team_id: Uuid,
    pub kind: PolicyKind,
    pub enabled: bool,
    /// Kind-specific settings, opaque except for [`PolicyKind::BlockFailedLogins`].
    #[serde(default)]
    pub data: serde_json::Value,
    pub revision_date: DateTime<Utc>,
}

/// Settings of a [`PolicyKind::BlockFailedLogins`] policy.
#[derive(Debug, Clone, Copy, Deserialize)]
struct BlockFailedLogins {
    max_failures: u32,
    lock_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTeam {
    pub name: String,
    pub billing_email: String,
    /// Team key encrypted for the creator.
    pub owner_key: String,
    /// Name of a first collection to create, if any.
    pub collection_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamUpdate {
    pub name: Option<String>,
    pub billing_email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Invitation {
    pub email: String,
    pub role: TeamRole,
    #[serde(default)]
    pub grants: Vec<CollectionGrant>,
}

/// One member's access to a collection, as set by
/// [`TeamService::set_collection_access`].
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CollectionAccess {
    pub member_id: Uuid,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub hide_passwords: bool,
}

/// Team management for one tenant.
#[derive(Clone)]
pub struct TeamService {
    barrier: Arc<Barrier>,
}

impl TeamService {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    // ── Teams ─────────────────────────────────────────────────────────

    /// Create a team with `owner` as its confirmed owner.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::InvalidInput`] for an empty name or key, or a
    /// malformed billing e-mail.
    pub async fn create(&self, owner: &User, new: NewTeam) -> Result<(Team, Member), TeamError> {
        let name = non_empty(&new.name, "team name")?;
        non_empty(&new.owner_key, "owner key")?;
        let billing_email = normalize_email(&new.billing_email).map_err(|_| TeamError::InvalidInput {
            reason: "malformed billing e-mail".to_owned(),
        })?;

        let now = Utc::now();
        let team = Team {
            id: Uuid::new_v4(),
            name,
            billing_email,
            seats: Plan::TeamsFree.included_seats(),
            created_at: now,
            revision_date: now,
        };
        let member = Member {
            id: Uuid::new_v4(),
            team_id: team.id,
            user_id: Some(owner.id),
            email: owner.email.clone(),
            role: TeamRole::Owner,
            status: MemberStatus::Confirmed,
            key: Some(new.owner_key),
            grants: Vec::new(),
            invited_at: now,
            accepted_at: Some(now),
            confirmed_at: Some(now),
        };

        self.save_team(&team).await?;
        self.save_member(&member).await?;
        self.link_user(owner.id, &member).await?;

        if let Some(collection_name) = new.collection_name.filter(|n| !n.trim().is_empty()) {
            self.insert_collection(team.id, collection_name, None).await?;
        }

        info!(team_id = %team.id, owner_id = %owner.id, "team created");
        Ok((team, member))
    }

    /// # Errors
    ///
    /// Returns [`TeamError::NotFound`] if the team does not exist.
    pub async fn get(&self, team_id: Uuid) -> Result<Team, TeamError> {
        self.barrier
            .get_json(&format!("{TEAM_PREFIX}{team_id}"))
            .await?
            .ok_or(TeamError::NotFound { kind: "team", id: team_id })
    }

    /// # Errors
    ///
    /// - [`TeamError::Forbidden`] unless the actor is an owner.
    /// - [`TeamError::InvalidInput`] for an empty name or malformed e-mail.
    pub async fn update(&self, actor_id: Uuid, team_id: Uuid, update: TeamUpdate) -> Result<Team, TeamError> {
        self.authorize(team_id, actor_id, TeamAction::ManageTeam).await?;
        let mut team = self.get(team_id).await?;
        if let Some(name) = update.name {
            team.name = non_empty(&name, "team name")?;
        }
        if let Some(email) = update.billing_email {
            team.billing_email = normalize_email(&email).map_err(|_| TeamError::InvalidInput {
                reason: "malformed billing e-mail".to_owned(),
            })?;
        }
        team.revision_date = Utc::now();
        self.save_team(&team).await?;
        Ok(team)
    }

    /// Delete the team with its members, collections, and policies. Team
    /// ciphers and the subscription are removed by the caller.
    ///
    /// Returns the user ids of former members.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Forbidden`] unless the actor is an owner.
    pub async fn delete(&self, actor_id: Uuid, team_id: Uuid) -> Result<Vec<Uuid>, TeamError> {
        self.authorize(team_id, actor_id, TeamAction::ManageTeam).await?;
        let members = self.all_members(team_id).await?;
        for member in &members {
            self.unlink(member).await?;
        }
        self.barrier.delete_prefix(&format!("{MEMBER_PREFIX}{team_id}/")).await?;
        self.barrier.delete_prefix(&format!("{COLLECTION_PREFIX}{team_id}/")).await?;
        self.barrier.delete_prefix(&format!("{POLICY_PREFIX}{team_id}/")).await?;
        self.barrier.delete(&format!("{TEAM_PREFIX}{team_id}")).await?;
        info!(team_id = %team_id, actor_id = %actor_id, "team deleted");
        Ok(members.iter().filter_map(|m| m.user_id).collect())
    }

    /// Set the seat count, e.g. after a plan change. Returns how many
    /// members the team holds beyond the new limit.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::NotFound`] if the team does not exist.
    pub async fn set_seats(&self, team_id: Uuid, seats: u32) -> Result<u32, TeamError> {
        let mut team = self.get(team_id).await?;
        team.seats = seats;
        team.revision_date = Utc::now();
        self.save_team(&team).await?;

        let in_use = u32::try_from(self.member_count(team_id).await?).unwrap_or(u32::MAX);
        let over = in_use.saturating_sub(seats);
        if over > 0 {
            warn!(team_id = %team_id, seats, in_use, "team is over its seat limit, new invitations are refused");
        }
        Ok(over)
    }

    /// Every team the user has accepted or confirmed membership of.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn teams_for_user(&self, user_id: Uuid) -> Result<Vec<(Team, Member)>, TeamError> {
        let prefix = format!("{USER_TEAMS_PREFIX}{user_id}/");
        let mut out = Vec::new();
        for link in self.barrier.values_json::<MemberRef>(&prefix).await? {
            let Some(member) = self.find_member(link.team_id, link.member_id).await? else {
                continue;
            };
            let team: Option<Team> = self.barrier.get_json(&format!("{TEAM_PREFIX}{}", link.team_id)).await?;
            if let Some(team) = team {
                out.push((team, member));
            }
        }
        Ok(out)
    }

    /// Every team id in the tenant.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn ids(&self) -> Result<Vec<Uuid>, TeamError> {
        Ok(self
            .barrier
            .list(TEAM_PREFIX)
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix(TEAM_PREFIX))
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }

    // ── Members ───────────────────────────────────────────────────────

    /// The user's membership of a team, in any status.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn membership(&self, team_id: Uuid, user_id: Uuid) -> Result<Option<Member>, TeamError> {
        let link: Option<MemberRef> = self
            .barrier
            .get_json(&format!("{USER_TEAMS_PREFIX}{user_id}/{team_id}"))
            .await?;
        match link {
            Some(link) => self.find_member(team_id, link.member_id).await,
            None => Ok(None),
        }
    }

    /// The user's confirmed membership of a team.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::NotFound`] when the user is not a confirmed
    /// member, so that non-members cannot probe for team ids.
    pub async fn confirmed_member(&self, team_id: Uuid, user_id: Uuid) -> Result<Member, TeamError> {
        self.membership(team_id, user_id)
            .await?
            .filter(|m| m.status == MemberStatus::Confirmed)
            .ok_or(TeamError::NotFound { kind: "team", id: team_id })
    }

    /// Require a confirmed member whose role allows `action`.
    ///
    /// # Errors
    ///
    /// - [`TeamError::NotFound`] if the user is not a confirmed member.
    /// - [`TeamError::Forbidden`] if their role is too low.
    pub async fn authorize(&self, team_id: Uuid, user_id: Uuid, action: TeamAction) -> Result<Member, TeamError> {
        let member = self.confirmed_member(team_id, user_id).await?;
        if permission::role_allows(member.role, action) {
            Ok(member)
        } else {
            Err(TeamError::Forbidden {
                reason: format!("role '{:?}' may not {action:?}", member.role).to_lowercase(),
            })
        }
    }

    /// Members of a team, visible to any confirmed member.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::NotFound`] if the caller is not a confirmed member.
    pub async fn members(&self, actor_id: Uuid, team_id: Uuid) -> Result<Vec<Member>, TeamError> {
        self.confirmed_member(team_id, actor_id).await?;
        self.all_members(team_id).await
    }

    /// Seats in use: members in any status.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn member_count(&self, team_id: Uuid) -> Result<usize, TeamError> {
        Ok(self.barrier.list(&format!("{MEMBER_PREFIX}{team_id}/")).await?.len())
    }

    /// User ids of every confirmed member.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn confirmed_user_ids(&self, team_id: Uuid) -> Result<Vec<Uuid>, TeamError> {
        Ok(self
            .all_members(team_id)
            .await?
            .into_iter()
            .filter(|m| m.status == MemberStatus::Confirmed)
            .filter_map(|m| m.user_id)
            .collect())
    }

    /// Invite an e-mail address to the team.
    ///
    /// # Errors
    ///
    /// - [`TeamError::Forbidden`] if the actor may not hand out `role`.
    /// - [`TeamError::SeatLimit`] if every seat is taken.
    /// - [`TeamError::Conflict`] if the address is already a member.
    pub async fn invite(&self, actor_id: Uuid, team_id: Uuid, invitation: Invitation) -> Result<Member, TeamError> {
        let actor = self.authorize(team_id, actor_id, TeamAction::ManageMembers).await?;
        if !permission::can_manage_member(actor.role, None, Some(invitation.role)) {
            return Err(TeamError::Forbidden {
                reason: "cannot invite a member with a role at or above your own".to_owned(),
            });
        }
        let email = normalize_email(&invitation.email).map_err(|_| TeamError::InvalidInput {
            reason: "malformed e-mail address".to_owned(),
        })?;

        let team = self.get(team_id).await?;
        let members = self.all_members(team_id).await?;
        if members.iter().any(|m| m.email == email) {
            return Err(TeamError::Conflict {
                reason: "address is already a member or invited".to_owned(),
            });
        }
        let in_use = u32::try_from(members.len()).unwrap_or(u32::MAX);
        if in_use >= team.seats {
            return Err(TeamError::SeatLimit {
                seats: team.seats,
                in_use,
            });
        }
        self.check_collections(team_id, &invitation.grants).await?;

        let member = Member {
            id: Uuid::new_v4(),
            team_id,
            user_id: None,
            email,
            role: invitation.role,
            status: MemberStatus::Invited,
            key: None,
            grants: invitation.grants,
            invited_at: Utc::now(),
            accepted_at: None,
            confirmed_at: None,
        };
        self.save_member(&member).await?;
        self.barrier
            .put_json(&self.invite_key(&member.email, team_id), &MemberRef::of(&member))
            .await?;
        info!(team_id = %team_id, member_id = %member.id, "member invited");
        Ok(member)
    }

    /// Open invitations addressed to the user's e-mail.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn pending_invitations(&self, user: &User) -> Result<Vec<(Team, Member)>, TeamError> {
        let prefix = format!("{INVITE_PREFIX}{}/", self.barrier.blind_index(&user.email));
        let mut out = Vec::new();
        for link in self.barrier.values_json::<MemberRef>(&prefix).await? {
            if let Some(member) = self.find_member(link.team_id, link.member_id).await? {
                out.push((self.get(link.team_id).await?, member));
            }
        }
        Ok(out)
    }

    /// Accept an invitation. The invitation must be addressed to the user.
    ///
    /// # Errors
    ///
    /// - [`TeamError::NotFound`] if the invitation does not exist.
    /// - [`TeamError::Forbidden`] if it is addressed to someone else.
    /// - [`TeamError::Conflict`] if it was already accepted.
    pub async fn accept(&self, user: &User, team_id: Uuid, member_id: Uuid) -> Result<Member, TeamError> {
        let mut member = self.require_member(team_id, member_id).await?;
        if member.email != user.email {
            return Err(TeamError::Forbidden {
                reason: "invitation is addressed to another e-mail".to_owned(),
            });
        }
        if member.status != MemberStatus::Invited {
            return Err(TeamError::Conflict {
                reason: "invitation already accepted".to_owned(),
            });
        }
        if self.membership(team_id, user.id).await?.is_some() {
            return Err(TeamError::Conflict {
                reason: "already a member of this team".to_owned(),
            });
        }

        member.user_id = Some(user.id);
        member.status = MemberStatus::Accepted;
        member.accepted_at = Some(Utc::now());
        self.save_member(&member).await?;
        self.link_user(user.id, &member).await?;
        self.barrier.delete(&self.invite_key(&member.email, team_id)).await?;
        info!(team_id = %team_id, member_id = %member.id, user_id = %user.id, "invitation accepted");
        Ok(member)
    }

    /// Confirm an accepted member, handing over the encrypted team key.
    ///
    /// # Errors
    ///
    /// - [`TeamError::Forbidden`] unless the actor is admin or owner.
    /// - [`TeamError::Conflict`] unless the member is in `accepted` status.
    pub async fn confirm(&self, actor_id: Uuid, team_id: Uuid, member_id: Uuid, key: String) -> Result<Member, TeamError> {
        self.authorize(team_id, actor_id, TeamAction::ManageMembers).await?;
        non_empty(&key, "team key")?;
        let mut member = self.require_member(team_id, member_id).await?;
        if member.status != MemberStatus::Accepted {
            return Err(TeamError::Conflict {
                reason: format!("member is {:?}, not accepted", member.status).to_lowercase(),
            });
        }
        member.status = MemberStatus::Confirmed;
        member.key = Some(key);
        member.confirmed_at = Some(Utc::now());
        self.save_member(&member).await?;
        info!(team_id = %team_id, member_id = %member.id, "member confirmed");
        Ok(member)
    }

    /// Change a member's role and collection grants.
    ///
    /// # Errors
    ///
    /// - [`TeamError::Forbidden`] if the actor outranks neither the member
    ///   nor the new role.
    /// - [`TeamError::Conflict`] if this would leave the team without a
    ///   confirmed owner.
    pub async fn update_member(
        &self,
        actor_id: Uuid,
        team_id: Uuid,
        member_id: Uuid,
        role: TeamRole,
        grants: Vec<CollectionGrant>,
    ) -> Result<Member, TeamError> {
        let actor = self.authorize(team_id, actor_id, TeamAction::ManageMembers).await?;
        let mut member = self.require_member(team_id, member_id).await?;
        if !permission::can_manage_member(actor.role, Some(member.role), Some(role)) {
            return Err(TeamError::Forbidden {
                reason: "cannot change a member at or above your own role".to_owned(),
            });
        }
        if member.role == TeamRole::Owner && role != TeamRole::Owner {
            self.ensure_other_owner(team_id, member.id).await?;
        }
        self.check_collections(team_id, &grants).await?;

        member.role = role;
        member.grants = grants;
        self.save_member(&member).await?;
        info!(team_id = %team_id, member_id = %member.id, role = ?role, "member updated");
        Ok(member)
    }

    /// Remove a member.
    ///
    /// # Errors
    ///
    /// - [`TeamError::Forbidden`] if the member outranks or equals the actor.
    /// - [`TeamError::Conflict`] when removing the last confirmed owner.
    pub async fn remove_member(&self, actor_id: Uuid, team_id: Uuid, member_id: Uuid) -> Result<Member, TeamError> {
        let actor = self.authorize(team_id, actor_id, TeamAction::ManageMembers).await?;
        let member = self.require_member(team_id, member_id).await?;
        if !permission::can_manage_member(actor.role, Some(member.role), None) {
            return Err(TeamError::Forbidden {
                reason: "cannot remove a member at or above your own role".to_owned(),
            });
        }
        if member.role == TeamRole::Owner {
            self.ensure_other_owner(team_id, member.id).await?;
        }
        self.drop_member(&member).await?;
        info!(team_id = %team_id, member_id = %member.id, "member removed");
        Ok(member)
    }

    /// Leave a team.
    ///
    /// # Errors
    ///
    /// - [`TeamError::NotFound`] if the user is not a member.
    /// - [`TeamError::Conflict`] if the user is the last confirmed owner.
    pub async fn leave(&self, user_id: Uuid, team_id: Uuid) -> Result<(), TeamError> {
        let member = self
            .membership(team_id, user_id)
            .await?
            .ok_or(TeamError::NotFound { kind: "team", id: team_id })?;
        if member.role == TeamRole::Owner {
            self.ensure_other_owner(team_id, member.id).await?;
        }
        self.drop_member(&member).await?;
        info!(team_id = %team_id, user_id = %user_id, "member left team");
        Ok(())
    }

    /// Teams where the user is the only confirmed owner.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn sole_owned_teams(&self, user_id: Uuid) -> Result<Vec<Uuid>, TeamError> {
        let mut out = Vec::new();
        for (team, member) in self.teams_for_user(user_id).await? {
            if member.role == TeamRole::Owner
                && member.status == MemberStatus::Confirmed
                && self.ensure_other_owner(team.id, member.id).await.is_err()
            {
                out.push(team.id);
            }
        }
        Ok(out)
    }

    /// Drop every membership and pending invitation of a deleted user.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn forget_user(&self, user: &User) -> Result<(), TeamError> {
        for (_, member) in self.teams_for_user(user.id).await? {
            self.drop_member(&member).await?;
        }
        for (_, member) in self.pending_invitations(user).await? {
            self.drop_member(&member).await?;
        }
        Ok(())
    }

    /// Delete invitations that were not accepted within `ttl`. Returns how
    /// many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn expire_invitations(&self, now: DateTime<Utc>, ttl: Duration) -> Result<usize, TeamError> {
        let mut expired = 0usize;
        for member in self.barrier.values_json::<Member>(MEMBER_PREFIX).await? {
            if member.status == MemberStatus::Invited && member.invited_at + ttl <= now {
                self.drop_member(&member).await?;
                expired = expired.saturating_add(1);
            }
        }
        Ok(expired)
    }

    // ── Collections ───────────────────────────────────────────────────

    /// # Errors
    ///
    /// - [`TeamError::Forbidden`] unless the actor is admin or owner.
    /// - [`TeamError::InvalidInput`] for an empty name.
    pub async fn create_collection(
        &self,
        actor_id: Uuid,
        team_id: Uuid,
        name: String,
        external_id: Option<String>,
    ) -> Result<Collection, TeamError> {
        self.authorize(team_id, actor_id, TeamAction::ManageAllCollections).await?;
        self.insert_collection(team_id, name, external_id).await
    }

    /// # Errors
    ///
    /// - [`TeamError::NotFound`] if the collection does not exist.
    pub async fn collection(&self, team_id: Uuid, collection_id: Uuid) -> Result<Collection, TeamError> {
        self.barrier
            .get_json(&format!("{COLLECTION_PREFIX}{team_id}/{collection_id}"))
            .await?
            .ok_or(TeamError::NotFound {
                kind: "collection",
                id: collection_id,
            })
    }

    /// Rename a collection.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Forbidden`] unless the actor is admin+ or a
    /// manager granted this collection.
    pub async fn update_collection(
        &self,
        actor_id: Uuid,
        team_id: Uuid,
        collection_id: Uuid,
        name: String,
        external_id: Option<String>,
    ) -> Result<Collection, TeamError> {
        self.require_collection_manager(team_id, actor_id, collection_id).await?;
        let mut collection = self.collection(team_id, collection_id).await?;
        collection.name = non_empty(&name, "collection name")?;
        collection.external_id = external_id;
        collection.revision_date = Utc::now();
        self.save_collection(&collection).await?;
        Ok(collection)
    }

    /// Delete a collection and every grant on it. Removing the collection
    /// from team ciphers is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Forbidden`] unless the actor is admin+ or a
    /// manager granted this collection.
    pub async fn delete_collection(&self, actor_id: Uuid, team_id: Uuid, collection_id: Uuid) -> Result<(), TeamError> {
        self.require_collection_manager(team_id, actor_id, collection_id).await?;
        self.collection(team_id, collection_id).await?;
        for mut member in self.all_members(team_id).await? {
            let before = member.grants.len();
            member.grants.retain(|g| g.collection_id != collection_id);
            if member.grants.len() != before {
                self.save_member(&member).await?;
            }
        }
        self.barrier
            .delete(&format!("{COLLECTION_PREFIX}{team_id}/{collection_id}"))
            .await?;
        info!(team_id = %team_id, collection_id = %collection_id, "collection deleted");
        Ok(())
    }

    /// Collections of a team the member can see.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn collections_for(&self, member: &Member) -> Result<Vec<Collection>, TeamError> {
        Ok(self
            .barrier
            .values_json::<Collection>(&format!("{COLLECTION_PREFIX}{}/", member.team_id))
            .await?
            .into_iter()
            .filter(|c| permission::can_view_collection(member, c.id))
            .collect())
    }

    /// Replace the set of members who can access a collection.
    ///
    /// # Errors
    ///
    /// - [`TeamError::Forbidden`] unless the actor may manage the collection.
    /// - [`TeamError::NotFound`] for an unknown collection or member.
    pub async fn set_collection_access(
        &self,
        actor_id: Uuid,
        team_id: Uuid,
        collection_id: Uuid,
        access: &[CollectionAccess],
    ) -> Result<(), TeamError> {
        self.require_collection_manager(team_id, actor_id, collection_id).await?;
        self.collection(team_id, collection_id).await?;

        let members = self.all_members(team_id).await?;
        if let Some(unknown) = access.iter().find(|a| !members.iter().any(|m| m.id == a.member_id)) {
            return Err(TeamError::NotFound {
                kind: "member",
                id: unknown.member_id,
            });
        }

        for mut member in members {
            let before = member.grants.clone();
            member.grants.retain(|g| g.collection_id != collection_id);
            if let Some(entry) = access.iter().find(|a| a.member_id == member.id) {
                member.grants.push(CollectionGrant {
                    collection_id,
                    read_only: entry.read_only,
                    hide_passwords: entry.hide_passwords,
                });
            }
            if member.grants != before {
                self.save_member(&member).await?;
            }
        }
        Ok(())
    }

    // ── Policies ──────────────────────────────────────────────────────

    /// # Errors
    ///
    /// - [`TeamError::Forbidden`] unless the actor is admin or owner.
    /// - [`TeamError::InvalidInput`] if block-failed-logins settings are malformed.
    pub async fn set_policy(
        &self,
        actor_id: Uuid,
        team_id: Uuid,
        kind: PolicyKind,
        enabled: bool,
        data: serde_json::Value,
    ) -> Result<Policy, TeamError> {
        self.authorize(team_id, actor_id, TeamAction::ManagePolicies).await?;
        if kind == PolicyKind::BlockFailedLogins && enabled {
            let settings: BlockFailedLogins =
                serde_json::from_value(data.clone()).map_err(|e| TeamError::InvalidInput {
                    reason: format!("block_failed_logins settings: {e}"),
                })?;
            if settings.max_failures == 0 || settings.lock_minutes <= 0 {
                return Err(TeamError::InvalidInput {
                    reason: "block_failed_logins needs positive max_failures and lock_minutes".to_owned(),
                });
            }
        }
        let policy = Policy {
            team_id,
            kind,
            enabled,
            data,
            revision_date: Utc::now(),
        };
        self.barrier
            .put_json(&format!("{POLICY_PREFIX}{team_id}/{}", kind.as_str()), &policy)
            .await?;
        info!(team_id = %team_id, kind = kind.as_str(), enabled, "policy updated");
        Ok(policy)
    }

    /// Every policy of a team, enabled or not.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn policies(&self, team_id: Uuid) -> Result<Vec<Policy>, TeamError> {
        Ok(self.barrier.values_json(&format!("{POLICY_PREFIX}{team_id}/")).await?)
    }

    /// Enabled policies that bind the user: those of teams where the user is
    /// a confirmed member below admin.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn policies_for_user(&self, user_id: Uuid) -> Result<Vec<Policy>, TeamError> {
        let mut out = Vec::new();
        for (team, member) in self.teams_for_user(user_id).await? {
            if member.status == MemberStatus::Confirmed && !member.role.is_admin() {
                out.extend(self.policies(team.id).await?.into_iter().filter(|p| p.enabled));
            }
        }
        Ok(out)
    }

    /// The strictest lockout among the user's block-failed-logins policies,
    /// or the default.
    ///
    /// # Errors
    ///
    /// Returns [`TeamError::Barrier`] if storage fails.
    pub async fn lockout_rule(&self, user_id: Uuid) -> Result<LockoutRule, TeamError> {
        let mut rule = LockoutRule::default();
        for policy in self.policies_for_user(user_id).await? {
            if policy.kind != PolicyKind::BlockFailedLogins {
                continue;
            }
            if let Ok(settings) = serde_json::from_value::<BlockFailedLogins>(policy.data) {
                rule.max_failures = rule.max_failures.min(settings.max_failures.max(1));
                rule.lock_for = rule.lock_for.max(Duration::minutes(settings.lock_minutes));
            }
        }
        Ok(rule)
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn all_members(&self, team_id: Uuid) -> Result<Vec<Member>, TeamError> {
        Ok(self.barrier.values_json(&format!("{MEMBER_PREFIX}{team_id}/")).await?)
    }

    async fn find_member(&self, team_id: Uuid, member_id: Uuid) -> Result<Option<Member>, TeamError> {
        Ok(self
            .barrier
            .get_json(&format!("{MEMBER_PREFIX}{team_id}/{member_id}"))
            .await?)
    }

    async fn require_member(&self, team_id: Uuid, member_id: Uuid) -> Result<Member, TeamError> {
        self.find_member(team_id, member_id)
            .await?
            .ok_or(TeamError::NotFound { kind: "member", id: member_id })
    }

    async fn require_collection_manager(&self, team_id: Uuid, user_id: Uuid, collection_id: Uuid) -> Result<(), TeamError> {
        let member = self.confirmed_member(team_id, user_id).await?;
        if permission::can_manage_collection(&member, collection_id) {
            Ok(())
        } else {
            Err(TeamError::Forbidden {
                reason: "may not manage this collection".to_owned(),
            })
        }
    }

    async fn ensure_other_owner(&self, team_id: Uuid, except: Uuid) -> Result<(), TeamError> {
        let others = self
            .all_members(team_id)
            .await?
            .into_iter()
            .any(|m| m.id != except && m.role == TeamRole::Owner && m.status == MemberStatus::Confirmed);
        if others {
            Ok(())
        } else {
            Err(TeamError::Conflict {
                reason: "a team must keep at least one confirmed owner".to_owned(),
            })
        }
    }

    async fn check_collections(&self, team_id: Uuid, grants: &[CollectionGrant]) -> Result<(), TeamError> {
        for grant in grants {
            self.collection(team_id, grant.collection_id).await?;
        }
        Ok(())
    }

    async fn insert_collection(&self, team_id: Uuid, name: String, external_id: Option<String>) -> Result<Collection, TeamError> {
        let now = Utc::now();
        let collection = Collection {
            id: Uuid::new_v4(),
            team_id,
            name: non_empty(&name, "collection name")?,
            external_id,
            created_at: now,
            revision_date: now,
        };
        self.save_collection(&collection).await?;
        info!(team_id = %team_id, collection_id = %collection.id, "collection created");
        Ok(collection)
    }

    async fn drop_member(&self, member: &Member) -> Result<(), TeamError> {
        self.unlink(member).await?;
        self.barrier
            .delete(&format!("{MEMBER_PREFIX}{}/{}", member.team_id, member.id))
            .await?;
        Ok(())
    }

    async fn unlink(&self, member: &Member) -> Result<(), TeamError> {
        if let Some(user_id) = member.user_id {
            self.barrier
                .delete(&format!("{USER_TEAMS_PREFIX}{user_id}/{}", member.team_id))
                .await?;
        }
        self.barrier.delete(&self.invite_key(&member.email, member.team_id)).await?;
        Ok(())
    }

    async fn link_user(&self, user_id: Uuid, member: &Member) -> Result<(), TeamError> {
        self.barrier
            .put_json(&format!("{USER_TEAMS_PREFIX}{user_id}/{}", member.team_id), &MemberRef::of(member))
            .await?;
        Ok(())
    }

    async fn save_team(&self, team: &Team) -> Result<(), TeamError> {
        self.barrier.put_json(&format!("{TEAM_PREFIX}{}", team.id), team).await?;
        Ok(())
    }

    async fn save_member(&self, member: &Member) -> Result<(), TeamError> {
        self.barrier
            .put_json(&format!("{MEMBER_PREFIX}{}/{}", member.team_id, member.id), member)
            .await?;
        Ok(())
    }

    async fn save_collection(&self, collection: &Collection) -> Result<(), TeamError> {
        self.barrier
            .put_json(&format!("{COLLECTION_PREFIX}{}/{}", collection.team_id, collection.id), collection)
            .await?;
        Ok(())
    }

    fn invite_key(&self, email: &str, team_id: Uuid) -> String {
        format!("{INVITE_PREFIX}{}/{team_id}", self.barrier.blind_index(email))
    }
}

/// Index entry pointing at a member record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct MemberRef {
    team_id: Uuid,
    member_id: Uuid,
}

impl MemberRef {
    fn of(member: &Member) -> Self {
        Self {
            team_id: member.team_id,
            member_id: member.id,
        }
    }
}

fn non_empty(value: &str, what: &str) -> Result<String, TeamError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(TeamError::InvalidInput {
            reason: format!("{what} must not be empty"),
        })
    } else {
        Ok(trimmed.to_owned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::user::UserStore;
    use crate::user::tests::{barrier, registration};

    struct Fixture {
        teams: TeamService,
        users: UserStore,
        owner: User,
        team: Team,
    }

    async fn fixture() -> Fixture {
        let barrier = barrier();
        let users = UserStore::new(Arc::clone(&barrier));
        let teams = TeamService::new(barrier);
        let owner = users.create(registration("owner@example.com")).await.unwrap();
        let (team, _) = teams
            .create(
                &owner,
                NewTeam {
                    name: "Acme".to_owned(),
                    billing_email: "billing@acme.io".to_owned(),
                    owner_key: "4.team-key".to_owned(),
                    collection_name: Some("Default".to_owned()),
                },
            )
            .await
            .unwrap();
        Fixture { teams, users, owner, team }
    }

    impl Fixture {
        async fn join(&self, email: &str, role: TeamRole) -> (User, Member) {
            let user = self.users.create(registration(email)).await.unwrap();
            let invited = self
                .teams
                .invite(
                    self.owner.id,
                    self.team.id,
                    Invitation {
                        email: email.to_owned(),
                        role,
                        grants: Vec::new(),
                    },
                )
                .await
                .unwrap();
            self.teams.accept(&user, self.team.id, invited.id).await.unwrap();
            let member = self
                .teams
                .confirm(self.owner.id, self.team.id, invited.id, "4.k".to_owned())
                .await
                .unwrap();
            (user, member)
        }
    }

    #[tokio::test]
    async fn creator_is_confirmed_owner_with_default_collection() {
        let f = fixture().await;
        let member = f.teams.confirmed_member(f.team.id, f.owner.id).await.unwrap();
        assert_eq!(member.role, TeamRole::Owner);
        assert_eq!(f.teams.collections_for(&member).await.unwrap().len(), 1);
        assert_eq!(f.team.seats, 2);
    }

    #[tokio::test]
    async fn invitation_lifecycle() {
        let f = fixture().await;
        let bob = f.users.create(registration("bob@example.com")).await.unwrap();
        let invited = f
            .teams
            .invite(
                f.owner.id,
                f.team.id,
                Invitation {
                    email: "Bob@Example.com".to_owned(),
                    role: TeamRole::Member,
                    grants: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(f.teams.pending_invitations(&bob).await.unwrap().len(), 1);

        let accepted = f.teams.accept(&bob, f.team.id, invited.id).await.unwrap();
        assert_eq!(accepted.status, MemberStatus::Accepted);
        assert!(f.teams.pending_invitations(&bob).await.unwrap().is_empty());
        assert!(f.teams.confirmed_member(f.team.id, bob.id).await.is_err());

        f.teams
            .confirm(f.owner.id, f.team.id, invited.id, "4.k".to_owned())
            .await
            .unwrap();
        assert!(f.teams.confirmed_member(f.team.id, bob.id).await.is_ok());
        assert_eq!(f.teams.teams_for_user(bob.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn accept_requires_matching_email() {
        let f = fixture().await;
        let mallory = f.users.create(registration("mallory@example.com")).await.unwrap();
        let invited = f
            .teams
            .invite(
                f.owner.id,
                f.team.id,
                Invitation {
                    email: "bob@example.com".to_owned(),
                    role: TeamRole::Member,
                    grants: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            f.teams.accept(&mallory, f.team.id, invited.id).await,
            Err(TeamError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn seat_limit_enforced() {
        let f = fixture().await;
        f.join("a@example.com", TeamRole::Member).await;
        let result = f
            .teams
            .invite(
                f.owner.id,
                f.team.id,
                Invitation {
                    email: "c@example.com".to_owned(),
                    role: TeamRole::Member,
                    grants: Vec::new(),
                },
            )
            .await;
        assert!(matches!(result, Err(TeamError::SeatLimit { seats: 2, in_use: 2 })));

        f.teams.set_seats(f.team.id, 10).await.unwrap();
        assert!(
            f.teams
                .invite(
                    f.owner.id,
                    f.team.id,
                    Invitation {
                        email: "c@example.com".to_owned(),
                        role: TeamRole::Member,
                        grants: Vec::new(),
                    },
                )
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn shrinking_seats_keeps_members_and_blocks_invites() {
        let f = fixture().await;
        f.teams.set_seats(f.team.id, 10).await.unwrap();
        f.join("a@example.com", TeamRole::Member).await;
        f.join("b@example.com", TeamRole::Member).await;

        assert_eq!(f.teams.set_seats(f.team.id, 2).await.unwrap(), 1);
        assert_eq!(f.teams.member_count(f.team.id).await.unwrap(), 3);
        let result = f
            .teams
            .invite(
                f.owner.id,
                f.team.id,
                Invitation {
                    email: "c@example.com".to_owned(),
                    role: TeamRole::Member,
                    grants: Vec::new(),
                },
            )
            .await;
        assert!(matches!(result, Err(TeamError::SeatLimit { seats: 2, in_use: 3 })));
    }

    #[tokio::test]
    async fn admin_cannot_promote_to_owner_or_remove_peers() {
        let f = fixture().await;
        f.teams.set_seats(f.team.id, 10).await.unwrap();
        let (admin, _) = f.join("admin@example.com", TeamRole::Admin).await;
        let (_, peer) = f.join("peer@example.com", TeamRole::Admin).await;
        let (_, member) = f.join("m@example.com", TeamRole::Member).await;

        assert!(matches!(
            f.teams
                .update_member(admin.id, f.team.id, member.id, TeamRole::Owner, Vec::new())
                .await,
            Err(TeamError::Forbidden { .. })
        ));
        assert!(matches!(
            f.teams.remove_member(admin.id, f.team.id, peer.id).await,
            Err(TeamError::Forbidden { .. })
        ));
        assert!(f.teams.remove_member(admin.id, f.team.id, member.id).await.is_ok());
    }

    #[tokio::test]
    async fn last_owner_cannot_leave_or_be_demoted() {
        let f = fixture().await;
        assert!(matches!(
            f.teams.leave(f.owner.id, f.team.id).await,
            Err(TeamError::Conflict { .. })
        ));
        let owner_member = f.teams.confirmed_member(f.team.id, f.owner.id).await.unwrap();
        assert!(matches!(
            f.teams
                .update_member(f.owner.id, f.team.id, owner_member.id, TeamRole::Admin, Vec::new())
                .await,
            Err(TeamError::Conflict { .. })
        ));
        assert_eq!(f.teams.sole_owned_teams(f.owner.id).await.unwrap(), vec![f.team.id]);
    }

    #[tokio::test]
    async fn collection_access_replaces_grants() {
        let f = fixture().await;
        let (user, member) = f.join("m@example.com", TeamRole::Member).await;
        let collection = f
            .teams
            .create_collection(f.owner.id, f.team.id, "Ops".to_owned(), None)
            .await
            .unwrap();

        f.teams
            .set_collection_access(
                f.owner.id,
                f.team.id,
                collection.id,
                &[CollectionAccess {
                    member_id: member.id,
                    read_only: true,
                    hide_passwords: false,
                }],
            )
            .await
            .unwrap();
        let member = f.teams.confirmed_member(f.team.id, user.id).await.unwrap();
        assert_eq!(member.grants.len(), 1);
        assert_eq!(f.teams.collections_for(&member).await.unwrap().len(), 1);

        f.teams
            .delete_collection(f.owner.id, f.team.id, collection.id)
            .await
            .unwrap();
        let member = f.teams.confirmed_member(f.team.id, user.id).await.unwrap();
        assert!(member.grants.is_empty());
    }

    #[tokio::test]
    async fn members_cannot_create_collections() {
        let f = fixture().await;
        let (user, _) = f.join("m@example.com", TeamRole::Member).await;
        assert!(matches!(
            f.teams
                .create_collection(user.id, f.team.id, "x".to_owned(), None)
                .await,
            Err(TeamError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn block_failed_logins_policy_tightens_lockout() {
        let f = fixture().await;
        let (user, _) = f.join("m@example.com", TeamRole::Member).await;
        f.teams
            .set_policy(
                f.owner.id,
                f.team.id,
                PolicyKind::BlockFailedLogins,
                true,
                serde_json::json!({"max_failures": 3, "lock_minutes": 60}),
            )
            .await
            .unwrap();

        let rule = f.teams.lockout_rule(user.id).await.unwrap();
        assert_eq!(rule.max_failures, 3);
        assert_eq!(rule.lock_for, Duration::minutes(60));

        // Owners are exempt.
        assert_eq!(f.teams.lockout_rule(f.owner.id).await.unwrap(), LockoutRule::default());
    }

    #[tokio::test]
    async fn stale_invitations_expire() {
        let f = fixture().await;
        f.teams
            .invite(
                f.owner.id,
                f.team.id,
                Invitation {
                    email: "late@example.com".to_owned(),
                    role: TeamRole::Member,
                    grants: Vec::new(),
                },
            )
            .await
            .unwrap();
        let later = Utc::now() + Duration::days(8);
        assert_eq!(f.teams.expire_invitations(later, Duration::days(7)).await.unwrap(), 1);
        assert_eq!(f.teams.members(f.owner.id, f.team.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_team_removes_memberships() {
        let f = fixture().await;
        let (user, _) = f.join("m@example.com", TeamRole::Member).await;
        let former = f.teams.delete(f.owner.id, f.team.id).await.unwrap();
        assert_eq!(former.len(), 2);
        assert!(f.teams.teams_for_user(user.id).await.unwrap().is_empty());
        assert!(f.teams.get(f.team.id).await.is_err());
    }
}
