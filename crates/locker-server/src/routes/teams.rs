//! Team routes: teams, members and invitations, collections, policies and
//! the team activity feed. Role checks happen in the team service.

use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use locker_core::event::EventKind;
use locker_core::permission::TeamAction;
use locker_core::team::{
    Collection, CollectionAccess, CollectionGrant, Invitation, Member, NewTeam, Policy, PolicyKind, Team,
    TeamRole, TeamUpdate,
};

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::routes::accounts::{EventListResponse, EventsQuery};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TeamMembership {
    pub team: Team,
    pub member: Member,
}

#[derive(Debug, Serialize)]
pub struct TeamListResponse {
    pub teams: Vec<TeamMembership>,
}

#[derive(Debug, Serialize)]
pub struct MemberListResponse {
    pub members: Vec<Member>,
}

#[derive(Debug, Serialize)]
pub struct CollectionListResponse {
    pub collections: Vec<Collection>,
}

#[derive(Debug, Serialize)]
pub struct PolicyListResponse {
    pub policies: Vec<Policy>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    /// Team key encrypted to the member's public key.
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct MemberUpdateRequest {
    pub role: TeamRole,
    #[serde(default)]
    pub grants: Vec<CollectionGrant>,
}

#[derive(Debug, Deserialize)]
pub struct CollectionRequest {
    pub name: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CollectionAccessRequest {
    pub members: Vec<CollectionAccess>,
}

#[derive(Debug, Deserialize)]
pub struct PolicyRequest {
    pub enabled: bool,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/teams", get(list_teams).post(create_team))
        .route("/teams/invitations", get(list_invitations))
        .route("/teams/{team_id}", get(get_team).put(update_team).delete(delete_team))
        .route("/teams/{team_id}/leave", post(leave_team))
        .route("/teams/{team_id}/members", get(list_members).post(invite_member))
        .route(
            "/teams/{team_id}/members/{member_id}",
            put(update_member).delete(remove_member),
        )
        .route("/teams/{team_id}/members/{member_id}/accept", post(accept_invitation))
        .route("/teams/{team_id}/members/{member_id}/confirm", post(confirm_member))
        .route("/teams/{team_id}/collections", get(list_collections).post(create_collection))
        .route(
            "/teams/{team_id}/collections/{collection_id}",
            put(update_collection).delete(delete_collection),
        )
        .route(
            "/teams/{team_id}/collections/{collection_id}/access",
            put(set_collection_access),
        )
        .route("/teams/{team_id}/policies", get(list_policies))
        .route("/teams/{team_id}/policies/{kind}", put(set_policy))
        .route("/teams/{team_id}/events", get(list_events))
}

fn pairs(teams: Vec<(Team, Member)>) -> Vec<TeamMembership> {
    teams
        .into_iter()
        .map(|(team, member)| TeamMembership { team, member })
        .collect()
}

// ── Teams ────────────────────────────────────────────────────────────

/// `GET /api/teams`: teams the caller has accepted or confirmed.
async fn list_teams(Extension(auth): Extension<AuthContext>) -> Result<Json<TeamListResponse>, AppError> {
    let teams = auth.locker.teams.teams_for_user(auth.user.id).await?;
    Ok(Json(TeamListResponse { teams: pairs(teams) }))
}

/// `POST /api/teams`: the caller becomes the confirmed owner.
async fn create_team(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<NewTeam>,
) -> Result<(StatusCode, Json<TeamMembership>), AppError> {
    let (team, member) = auth.locker.teams.create(&auth.user, body).await?;
    auth.record(auth.event(EventKind::TeamCreated).team(team.id).target(team.id))
        .await;
    Ok((StatusCode::CREATED, Json(TeamMembership { team, member })))
}

/// `GET /api/teams/invitations`: open invitations for the caller's e-mail.
async fn list_invitations(Extension(auth): Extension<AuthContext>) -> Result<Json<TeamListResponse>, AppError> {
    let invitations = auth.locker.teams.pending_invitations(&auth.user).await?;
    Ok(Json(TeamListResponse {
        teams: pairs(invitations),
    }))
}

/// `GET /api/teams/{team_id}`
async fn get_team(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
) -> Result<Json<TeamMembership>, AppError> {
    let member = auth
        .locker
        .teams
        .membership(team_id, auth.user.id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("team not found: {team_id}")))?;
    let team = auth.locker.teams.get(team_id).await?;
    Ok(Json(TeamMembership { team, member }))
}

/// `PUT /api/teams/{team_id}`
async fn update_team(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
    Json(body): Json<TeamUpdate>,
) -> Result<Json<Team>, AppError> {
    let team = auth.locker.teams.update(auth.user.id, team_id, body).await?;
    auth.record(auth.event(EventKind::TeamUpdated).team(team_id).target(team_id))
        .await;
    Ok(Json(team))
}

/// `DELETE /api/teams/{team_id}`: owners only; removes team ciphers too.
async fn delete_team(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    auth.locker.delete_team(auth.user.id, team_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/teams/{team_id}/leave`
async fn leave_team(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    auth.locker.teams.leave(auth.user.id, team_id).await?;
    auth.record(auth.event(EventKind::MemberLeft).team(team_id)).await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Members ──────────────────────────────────────────────────────────

/// `GET /api/teams/{team_id}/members`
async fn list_members(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
) -> Result<Json<MemberListResponse>, AppError> {
    let members = auth.locker.teams.members(auth.user.id, team_id).await?;
    Ok(Json(MemberListResponse { members }))
}

/// `POST /api/teams/{team_id}/members`: invite by e-mail.
async fn invite_member(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
    Json(body): Json<Invitation>,
) -> Result<(StatusCode, Json<Member>), AppError> {
    let member = auth.locker.teams.invite(auth.user.id, team_id, body).await?;
    auth.record(auth.event(EventKind::MemberInvited).team(team_id).target(member.id))
        .await;
    Ok((StatusCode::CREATED, Json(member)))
}

/// `POST /api/teams/{team_id}/members/{member_id}/accept`
async fn accept_invitation(
    Extension(auth): Extension<AuthContext>,
    Path((team_id, member_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Member>, AppError> {
    let member = auth.locker.teams.accept(&auth.user, team_id, member_id).await?;
    auth.record(auth.event(EventKind::MemberAccepted).team(team_id).target(member_id))
        .await;
    Ok(Json(member))
}

/// `POST /api/teams/{team_id}/members/{member_id}/confirm`
async fn confirm_member(
    Extension(auth): Extension<AuthContext>,
    Path((team_id, member_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<ConfirmRequest>,
) -> Result<Json<Member>, AppError> {
    let member = auth
        .locker
        .teams
        .confirm(auth.user.id, team_id, member_id, body.key)
        .await?;
    auth.record(auth.event(EventKind::MemberConfirmed).team(team_id).target(member_id))
        .await;
    Ok(Json(member))
}

/// `PUT /api/teams/{team_id}/members/{member_id}`: role and grants.
async fn update_member(
    Extension(auth): Extension<AuthContext>,
    Path((team_id, member_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<MemberUpdateRequest>,
) -> Result<Json<Member>, AppError> {
    let member = auth
        .locker
        .teams
        .update_member(auth.user.id, team_id, member_id, body.role, body.grants)
        .await?;
    auth.record(auth.event(EventKind::MemberUpdated).team(team_id).target(member_id))
        .await;
    Ok(Json(member))
}

/// `DELETE /api/teams/{team_id}/members/{member_id}`
async fn remove_member(
    Extension(auth): Extension<AuthContext>,
    Path((team_id, member_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    auth.locker
        .teams
        .remove_member(auth.user.id, team_id, member_id)
        .await?;
    auth.record(auth.event(EventKind::MemberRemoved).team(team_id).target(member_id))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Collections ──────────────────────────────────────────────────────

/// `GET /api/teams/{team_id}/collections`: collections the caller can see.
async fn list_collections(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
) -> Result<Json<CollectionListResponse>, AppError> {
    let member = auth.locker.teams.confirmed_member(team_id, auth.user.id).await?;
    let collections = auth.locker.teams.collections_for(&member).await?;
    Ok(Json(CollectionListResponse { collections }))
}

/// `POST /api/teams/{team_id}/collections`
async fn create_collection(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
    Json(body): Json<CollectionRequest>,
) -> Result<(StatusCode, Json<Collection>), AppError> {
    let collection = auth
        .locker
        .teams
        .create_collection(auth.user.id, team_id, body.name, body.external_id)
        .await?;
    auth.record(auth.event(EventKind::CollectionCreated).team(team_id).target(collection.id))
        .await;
    Ok((StatusCode::CREATED, Json(collection)))
}

/// `PUT /api/teams/{team_id}/collections/{collection_id}`
async fn update_collection(
    Extension(auth): Extension<AuthContext>,
    Path((team_id, collection_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<CollectionRequest>,
) -> Result<Json<Collection>, AppError> {
    let collection = auth
        .locker
        .teams
        .update_collection(auth.user.id, team_id, collection_id, body.name, body.external_id)
        .await?;
    auth.record(auth.event(EventKind::CollectionUpdated).team(team_id).target(collection_id))
        .await;
    Ok(Json(collection))
}

/// `DELETE /api/teams/{team_id}/collections/{collection_id}`: ciphers stay
/// in the team, minus this collection.
async fn delete_collection(
    Extension(auth): Extension<AuthContext>,
    Path((team_id, collection_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    auth.locker
        .delete_collection(auth.user.id, team_id, collection_id)
        .await?;
    auth.record(auth.event(EventKind::CollectionDeleted).team(team_id).target(collection_id))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /api/teams/{team_id}/collections/{collection_id}/access`: replace
/// the member list of a collection.
async fn set_collection_access(
    Extension(auth): Extension<AuthContext>,
    Path((team_id, collection_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<CollectionAccessRequest>,
) -> Result<StatusCode, AppError> {
    auth.locker
        .teams
        .set_collection_access(auth.user.id, team_id, collection_id, &body.members)
        .await?;
    auth.record(
        auth.event(EventKind::CollectionAccessChanged)
            .team(team_id)
            .target(collection_id),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Policies and events ──────────────────────────────────────────────

/// `GET /api/teams/{team_id}/policies`
async fn list_policies(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
) -> Result<Json<PolicyListResponse>, AppError> {
    auth.locker.teams.confirmed_member(team_id, auth.user.id).await?;
    let policies = auth.locker.teams.policies(team_id).await?;
    Ok(Json(PolicyListResponse { policies }))
}

/// `PUT /api/teams/{team_id}/policies/{kind}`
async fn set_policy(
    Extension(auth): Extension<AuthContext>,
    Path((team_id, kind)): Path<(Uuid, PolicyKind)>,
    Json(body): Json<PolicyRequest>,
) -> Result<Json<Policy>, AppError> {
    let policy = auth
        .locker
        .teams
        .set_policy(auth.user.id, team_id, kind, body.enabled, body.data)
        .await?;
    auth.record(auth.event(EventKind::PolicyUpdated).team(team_id)).await;
    Ok(Json(policy))
}

/// `GET /api/teams/{team_id}/events`: admins and owners only.
async fn list_events(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventListResponse>, AppError> {
    auth.locker
        .teams
        .authorize(team_id, auth.user.id, TeamAction::ViewEvents)
        .await?;
    let events = auth.locker.events.store().list_team(team_id, query.limit()).await?;
    Ok(Json(EventListResponse { events }))
}
