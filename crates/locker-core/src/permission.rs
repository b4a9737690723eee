//! Role-based permission resolution.
//!
//! Team roles are ranked `owner > admin > manager > member`. Team-wide
//! actions are static lookups against that ranking. Cipher access for
//! non-admin members is the union of their collection grants over the
//! cipher's collections.

use serde::Serialize;
use uuid::Uuid;

use crate::team::{Member, MemberStatus, TeamRole};

/// Team-wide actions gated by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamAction {
    /// Rename the team, change its billing e-mail, delete it.
    ManageTeam,
    /// Change the team's plan and payment details.
    ManageBilling,
    /// Invite, confirm, re-role, and remove members.
    ManageMembers,
    /// Enable, disable, and configure team policies.
    ManagePolicies,
    /// Create, edit, delete, and assign any collection.
    ManageAllCollections,
    /// Read the team's activity log.
    ViewEvents,
}

impl TeamRole {
    /// Numeric rank; higher outranks lower.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Owner => 3,
            Self::Admin => 2,
            Self::Manager => 1,
            Self::Member => 0,
        }
    }

    /// Whether this role is admin or owner.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        self.rank() >= Self::Admin.rank()
    }
}

/// Whether `role` may perform a team-wide `action`.
#[must_use]
pub const fn role_allows(role: TeamRole, action: TeamAction) -> bool {
    let required = match action {
        TeamAction::ManageTeam | TeamAction::ManageBilling => TeamRole::Owner,
        TeamAction::ManageMembers
        | TeamAction::ManagePolicies
        | TeamAction::ManageAllCollections
        | TeamAction::ViewEvents => TeamRole::Admin,
    };
    role.rank() >= required.rank()
}

/// Whether a member with `actor` role may act on a member currently holding
/// `target` (remove them, or change their role to `new_role`).
///
/// Owners may do anything. Everyone else may only touch members ranked
/// strictly below themselves and may only hand out roles strictly below
/// their own.
#[must_use]
pub fn can_manage_member(actor: TeamRole, target: Option<TeamRole>, new_role: Option<TeamRole>) -> bool {
    if actor == TeamRole::Owner {
        return true;
    }
    if !role_allows(actor, TeamAction::ManageMembers) {
        return false;
    }
    let target_ok = target.is_none_or(|t| t.rank() < actor.rank());
    let new_ok = new_role.is_none_or(|r| r.rank() < actor.rank());
    target_ok && new_ok
}

/// Effective access a user has to one cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CipherAccess {
    /// The cipher is visible.
    pub view: bool,
    /// The cipher may be modified, trashed, restored, or deleted.
    pub edit: bool,
    /// Hidden fields (passwords, TOTP seeds) must not be revealed.
    pub hide_passwords: bool,
}

impl CipherAccess {
    /// Full access: owner of a personal cipher, or team admin.
    pub const FULL: Self = Self {
        view: true,
        edit: true,
        hide_passwords: false,
    };

    /// Read-only access with every field visible.
    pub const READ_ONLY: Self = Self {
        view: true,
        edit: false,
        hide_passwords: false,
    };
}

/// Resolve a member's access to a team cipher in `collections`.
///
/// Returns `None` when the cipher is not visible at all: the member is not
/// yet confirmed, or none of their grants covers any of the cipher's
/// collections.
#[must_use]
pub fn team_cipher_access(member: &Member, collections: &[Uuid]) -> Option<CipherAccess> {
    if member.status != MemberStatus::Confirmed {
        return None;
    }
    if member.role.is_admin() {
        return Some(CipherAccess::FULL);
    }

    let mut matched = member
        .grants
        .iter()
        .filter(|g| collections.contains(&g.collection_id))
        .peekable();
    matched.peek()?;

    let manager = member.role == TeamRole::Manager;
    let mut edit = manager;
    let mut hide_passwords = !manager;
    for grant in matched {
        edit |= !grant.read_only;
        hide_passwords &= grant.hide_passwords;
    }

    Some(CipherAccess {
        view: true,
        edit,
        hide_passwords,
    })
}

/// Whether a member may see a collection.
#[must_use]
pub fn can_view_collection(member: &Member, collection_id: Uuid) -> bool {
    member.status == MemberStatus::Confirmed
        && (member.role.is_admin() || member.grants.iter().any(|g| g.collection_id == collection_id))
}

/// Whether a member may rename a collection or change who it is shared with.
///
/// Admins manage every collection; managers manage the ones granted to them.
#[must_use]
pub fn can_manage_collection(member: &Member, collection_id: Uuid) -> bool {
    if member.status != MemberStatus::Confirmed {
        return false;
    }
    if role_allows(member.role, TeamAction::ManageAllCollections) {
        return true;
    }
    member.role == TeamRole::Manager && member.grants.iter().any(|g| g.collection_id == collection_id)
}

/// Whether a member may place ciphers in every collection of `collections`.
#[must_use]
pub fn can_write_collections(member: &Member, collections: &[Uuid]) -> bool {
    if member.status != MemberStatus::Confirmed || collections.is_empty() {
        return false;
    }
    if member.role.is_admin() {
        return true;
    }
    collections.iter().all(|id| {
        member
            .grants
            .iter()
            .any(|g| g.collection_id == *id && (!g.read_only || member.role == TeamRole::Manager))
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::team::CollectionGrant;

    fn member(role: TeamRole, status: MemberStatus, grants: Vec<CollectionGrant>) -> Member {
        Member {
            id: Uuid::new_v4(),
            team_id: Uuid::new_v4(),
            user_id: Some(Uuid::new_v4()),
            email: "m@example.com".to_owned(),
            role,
            status,
            key: None,
            grants,
            invited_at: Utc::now(),
            accepted_at: None,
            confirmed_at: None,
        }
    }

    fn grant(collection_id: Uuid, read_only: bool, hide_passwords: bool) -> CollectionGrant {
        CollectionGrant {
            collection_id,
            read_only,
            hide_passwords,
        }
    }

    #[test]
    fn team_actions_follow_rank() {
        assert!(role_allows(TeamRole::Owner, TeamAction::ManageBilling));
        assert!(!role_allows(TeamRole::Admin, TeamAction::ManageBilling));
        assert!(role_allows(TeamRole::Admin, TeamAction::ManageMembers));
        assert!(!role_allows(TeamRole::Manager, TeamAction::ManageMembers));
        assert!(!role_allows(TeamRole::Member, TeamAction::ViewEvents));
    }

    #[test]
    fn admins_cannot_touch_peers_or_grant_admin() {
        assert!(can_manage_member(TeamRole::Admin, Some(TeamRole::Member), Some(TeamRole::Manager)));
        assert!(!can_manage_member(TeamRole::Admin, Some(TeamRole::Admin), None));
        assert!(!can_manage_member(TeamRole::Admin, None, Some(TeamRole::Admin)));
        assert!(!can_manage_member(TeamRole::Admin, None, Some(TeamRole::Owner)));
        assert!(can_manage_member(TeamRole::Owner, Some(TeamRole::Owner), Some(TeamRole::Member)));
        assert!(!can_manage_member(TeamRole::Manager, Some(TeamRole::Member), None));
    }

    #[test]
    fn unconfirmed_members_see_nothing() {
        let c = Uuid::new_v4();
        let m = member(TeamRole::Admin, MemberStatus::Accepted, vec![grant(c, false, false)]);
        assert_eq!(team_cipher_access(&m, &[c]), None);
    }

    #[test]
    fn admins_get_full_access_without_grants() {
        let m = member(TeamRole::Admin, MemberStatus::Confirmed, vec![]);
        assert_eq!(team_cipher_access(&m, &[Uuid::new_v4()]), Some(CipherAccess::FULL));
    }

    #[test]
    fn member_access_is_union_of_matching_grants() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let m = member(
            TeamRole::Member,
            MemberStatus::Confirmed,
            vec![grant(a, true, true), grant(b, false, false)],
        );

        assert_eq!(
            team_cipher_access(&m, &[a]),
            Some(CipherAccess {
                view: true,
                edit: false,
                hide_passwords: true
            })
        );
        assert_eq!(team_cipher_access(&m, &[a, b]), Some(CipherAccess::FULL));
        assert_eq!(team_cipher_access(&m, &[c]), None);
    }

    #[test]
    fn managers_edit_granted_collections() {
        let a = Uuid::new_v4();
        let m = member(TeamRole::Manager, MemberStatus::Confirmed, vec![grant(a, true, true)]);
        assert_eq!(team_cipher_access(&m, &[a]), Some(CipherAccess::FULL));
        assert!(can_manage_collection(&m, a));
        assert!(!can_manage_collection(&m, Uuid::new_v4()));
    }

    #[test]
    fn writing_requires_every_collection() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let m = member(
            TeamRole::Member,
            MemberStatus::Confirmed,
            vec![grant(a, false, false), grant(b, true, false)],
        );
        assert!(can_write_collections(&m, &[a]));
        assert!(!can_write_collections(&m, &[a, b]));
        assert!(!can_write_collections(&m, &[]));
        assert!(can_view_collection(&m, b));
    }
}
