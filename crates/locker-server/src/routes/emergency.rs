//! Emergency access routes.
//!
//! Grantor side: invite, confirm, approve, reject. Grantee side: accept,
//! initiate, then view or take over once approved. Either party may delete.

use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use locker_core::emergency::{EmergencyAccess, EmergencyInvite, TakeoverMaterial};
use locker_core::event::EventKind;
use locker_core::vault::CipherView;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::routes::ciphers::CipherListResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct GrantListResponse {
    pub grants: Vec<EmergencyAccess>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmGrantRequest {
    /// Grantor's account key encrypted to the grantee's public key.
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct TakeoverPasswordRequest {
    pub new_master_password_hash: String,
    /// Grantor's account key re-encrypted under the new master key.
    pub key: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/emergency/granted", get(list_granted).post(invite))
        .route("/emergency/trusted", get(list_trusted))
        .route("/emergency/{grant_id}", get(get_grant).delete(delete_grant))
        .route("/emergency/{grant_id}/accept", post(accept))
        .route("/emergency/{grant_id}/confirm", post(confirm))
        .route("/emergency/{grant_id}/initiate", post(initiate))
        .route("/emergency/{grant_id}/approve", post(approve))
        .route("/emergency/{grant_id}/reject", post(reject))
        .route("/emergency/{grant_id}/view", get(view))
        .route("/emergency/{grant_id}/takeover", post(takeover))
        .route("/emergency/{grant_id}/password", post(takeover_password))
}

async fn record(auth: &AuthContext, kind: EventKind, grant: &EmergencyAccess) {
    auth.record(auth.event(kind).target(grant.id)).await;
}

/// `GET /api/emergency/granted`: grants the caller gave.
async fn list_granted(Extension(auth): Extension<AuthContext>) -> Result<Json<GrantListResponse>, AppError> {
    let grants = auth.locker.emergency.granted_by(auth.user.id).await?;
    Ok(Json(GrantListResponse { grants }))
}

/// `POST /api/emergency/granted`: invite a trusted contact. Premium only.
async fn invite(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<EmergencyInvite>,
) -> Result<(StatusCode, Json<EmergencyAccess>), AppError> {
    let grant = auth.locker.invite_emergency_contact(&auth.user, body).await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

/// `GET /api/emergency/trusted`: grants naming the caller as grantee,
/// including invitations to the caller's e-mail.
async fn list_trusted(Extension(auth): Extension<AuthContext>) -> Result<Json<GrantListResponse>, AppError> {
    let grants = auth.locker.emergency.trusted_by(&auth.user).await?;
    Ok(Json(GrantListResponse { grants }))
}

/// `GET /api/emergency/{grant_id}`
async fn get_grant(
    Extension(auth): Extension<AuthContext>,
    Path(grant_id): Path<Uuid>,
) -> Result<Json<EmergencyAccess>, AppError> {
    Ok(Json(auth.locker.emergency.get(auth.user.id, grant_id).await?))
}

/// `DELETE /api/emergency/{grant_id}`: either party, any status.
async fn delete_grant(
    Extension(auth): Extension<AuthContext>,
    Path(grant_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    auth.locker.emergency.delete(auth.user.id, grant_id).await?;
    auth.record(auth.event(EventKind::EmergencyDeleted).target(grant_id)).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/emergency/{grant_id}/accept`
async fn accept(
    Extension(auth): Extension<AuthContext>,
    Path(grant_id): Path<Uuid>,
) -> Result<Json<EmergencyAccess>, AppError> {
    let grant = auth.locker.emergency.accept(&auth.user, grant_id).await?;
    record(&auth, EventKind::EmergencyAccepted, &grant).await;
    Ok(Json(grant))
}

/// `POST /api/emergency/{grant_id}/confirm`
async fn confirm(
    Extension(auth): Extension<AuthContext>,
    Path(grant_id): Path<Uuid>,
    Json(body): Json<ConfirmGrantRequest>,
) -> Result<Json<EmergencyAccess>, AppError> {
    let grant = auth
        .locker
        .emergency
        .confirm(auth.user.id, grant_id, body.key)
        .await?;
    record(&auth, EventKind::EmergencyConfirmed, &grant).await;
    Ok(Json(grant))
}

/// `POST /api/emergency/{grant_id}/initiate`: start the wait period.
async fn initiate(
    Extension(auth): Extension<AuthContext>,
    Path(grant_id): Path<Uuid>,
) -> Result<Json<EmergencyAccess>, AppError> {
    let grant = auth.locker.emergency.initiate(auth.user.id, grant_id).await?;
    auth.record(
        auth.event(EventKind::EmergencyRecoveryInitiated)
            .user(grant.grantor_id)
            .target(grant.id),
    )
    .await;
    Ok(Json(grant))
}

/// `POST /api/emergency/{grant_id}/approve`
async fn approve(
    Extension(auth): Extension<AuthContext>,
    Path(grant_id): Path<Uuid>,
) -> Result<Json<EmergencyAccess>, AppError> {
    let grant = auth.locker.emergency.approve(auth.user.id, grant_id).await?;
    record(&auth, EventKind::EmergencyRecoveryApproved, &grant).await;
    Ok(Json(grant))
}

/// `POST /api/emergency/{grant_id}/reject`
async fn reject(
    Extension(auth): Extension<AuthContext>,
    Path(grant_id): Path<Uuid>,
) -> Result<Json<EmergencyAccess>, AppError> {
    let grant = auth.locker.emergency.reject(auth.user.id, grant_id).await?;
    record(&auth, EventKind::EmergencyRecoveryRejected, &grant).await;
    Ok(Json(grant))
}

/// `GET /api/emergency/{grant_id}/view`: the grantor's personal ciphers.
async fn view(
    Extension(auth): Extension<AuthContext>,
    Path(grant_id): Path<Uuid>,
) -> Result<Json<CipherListResponse>, AppError> {
    let ciphers: Vec<CipherView> = auth.locker.emergency.view(auth.user.id, grant_id).await?;
    auth.record(auth.event(EventKind::EmergencyViewed).target(grant_id)).await;
    Ok(Json(CipherListResponse { ciphers }))
}

/// `POST /api/emergency/{grant_id}/takeover`: KDF and encrypted key of the
/// grantor.
async fn takeover(
    Extension(auth): Extension<AuthContext>,
    Path(grant_id): Path<Uuid>,
) -> Result<Json<TakeoverMaterial>, AppError> {
    Ok(Json(auth.locker.emergency.takeover(auth.user.id, grant_id).await?))
}

/// `POST /api/emergency/{grant_id}/password`: set the grantor's new master
/// password. Ends every grantor session.
async fn takeover_password(
    Extension(auth): Extension<AuthContext>,
    Path(grant_id): Path<Uuid>,
    Json(body): Json<TakeoverPasswordRequest>,
) -> Result<StatusCode, AppError> {
    auth.locker
        .emergency
        .takeover_password(auth.user.id, grant_id, &body.new_master_password_hash, body.key)
        .await?;
    auth.record(auth.event(EventKind::EmergencyTakeover).target(grant_id)).await;
    Ok(StatusCode::NO_CONTENT)
}
