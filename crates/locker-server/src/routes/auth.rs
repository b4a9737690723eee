//! Login and token refresh.

use std::sync::Arc;

use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use locker_core::auth::{LoginRequest, TokenPair};
use locker_core::user::Profile;

use crate::error::AppError;
use crate::middleware::Tenant;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub profile: Profile,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
}

/// `POST /api/auth/login`: exchange the master password hash for tokens.
async fn login(
    Extension(Tenant(locker)): Extension<Tenant>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let (user, tokens) = locker.login(&body).await?;
    Ok(Json(LoginResponse {
        tokens,
        profile: Profile::from(&user),
    }))
}

/// `POST /api/auth/refresh`: rotate a refresh token.
async fn refresh(
    Extension(Tenant(locker)): Extension<Tenant>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let tokens = locker.auth.refresh(&body.refresh_token).await?;
    Ok(Json(tokens))
}
