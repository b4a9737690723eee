//! Account routes: registration, prelogin, profile, master password,
//! logout, deletion and the caller's own activity feed.

use std::sync::Arc;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use locker_core::event::{ActivityEvent, EventKind};
use locker_core::user::{KdfParams, Profile, ProfileUpdate, Registration};

use crate::error::AppError;
use crate::middleware::{AuthContext, Tenant};
use crate::state::AppState;

/// Upper bound on one page of the activity feed.
pub const MAX_EVENTS_PAGE: usize = 500;

#[derive(Debug, Deserialize)]
pub struct PreloginRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub master_password_hash: String,
    pub new_master_password_hash: String,
    /// Account key re-encrypted under the new master key.
    pub key: String,
    #[serde(default)]
    pub kdf: Option<KdfParams>,
}

/// Body of requests that must re-prove the master password.
#[derive(Debug, Deserialize)]
pub struct PasswordConfirmation {
    pub master_password_hash: String,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

impl EventsQuery {
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(100).clamp(1, MAX_EVENTS_PAGE)
    }
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<ActivityEvent>,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub revoked: usize,
}

/// Routes that need no session.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/accounts/register", post(register))
        .route("/accounts/prelogin", post(prelogin))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/accounts", axum::routing::delete(delete_account))
        .route("/accounts/profile", get(get_profile).put(update_profile))
        .route("/accounts/password", post(change_password))
        .route("/accounts/logout", post(logout))
        .route("/accounts/events", get(list_events))
}

/// `POST /api/accounts/register`
async fn register(
    Extension(Tenant(locker)): Extension<Tenant>,
    Json(body): Json<Registration>,
) -> Result<(StatusCode, Json<Profile>), AppError> {
    let user = locker.auth.register(body).await?;
    Ok((StatusCode::CREATED, Json(Profile::from(&user))))
}

/// `POST /api/accounts/prelogin`: KDF parameters for an e-mail address.
async fn prelogin(
    Extension(Tenant(locker)): Extension<Tenant>,
    Json(body): Json<PreloginRequest>,
) -> Result<Json<KdfParams>, AppError> {
    Ok(Json(locker.auth.prelogin(&body.email).await?))
}

/// `GET /api/accounts/profile`
async fn get_profile(Extension(auth): Extension<AuthContext>) -> Json<Profile> {
    Json(Profile::from(&auth.user))
}

/// `PUT /api/accounts/profile`
async fn update_profile(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ProfileUpdate>,
) -> Result<Json<Profile>, AppError> {
    let user = auth.locker.users.update_profile(auth.user.id, body).await?;
    Ok(Json(Profile::from(&user)))
}

/// `POST /api/accounts/password`: change the master password. Ends every
/// session, including this one.
async fn change_password(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<StatusCode, AppError> {
    let mut user = auth.user.clone();
    auth.locker
        .auth
        .change_password(
            &mut user,
            &body.master_password_hash,
            &body.new_master_password_hash,
            body.key,
            body.kdf,
        )
        .await?;
    auth.record(auth.event(EventKind::PasswordChanged)).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/accounts/logout`: revoke this device's refresh tokens.
async fn logout(Extension(auth): Extension<AuthContext>) -> Result<Json<LogoutResponse>, AppError> {
    let revoked = auth.locker.auth.logout(auth.user.id, &auth.claims.device).await?;
    Ok(Json(LogoutResponse { revoked }))
}

/// `DELETE /api/accounts`: delete the account and everything it owns.
async fn delete_account(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<PasswordConfirmation>,
) -> Result<StatusCode, AppError> {
    auth.locker.delete_account(&auth.user, &body.master_password_hash).await?;
    info!(tenant = %auth.locker.alias(), user_id = %auth.user.id, "account deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/accounts/events`: the caller's activity, newest first.
async fn list_events(
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventListResponse>, AppError> {
    let events = auth.locker.events.store().list_user(auth.user.id, query.limit()).await?;
    Ok(Json(EventListResponse { events }))
}
