//! Full vault sync.

use std::sync::Arc;

use axum::routing::get;
use axum::{Extension, Json, Router};

use locker_core::locker::SyncData;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/sync", get(sync))
}

/// `GET /api/sync`: profile, folders, visible ciphers, collections, team
/// memberships and effective policies in one response.
async fn sync(Extension(auth): Extension<AuthContext>) -> Result<Json<SyncData>, AppError> {
    Ok(Json(auth.locker.sync(&auth.user).await?))
}
