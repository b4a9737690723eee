//! Relay alias routes.
//!
//! Alias management is per-user. `POST /relay/inbound` is called by the mail
//! transport, not by clients, and sits behind the relay secret.

use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use locker_core::event::EventKind;
use locker_core::relay::{AliasUpdate, InboundRoute, NewAlias, RelayAlias};

use crate::error::AppError;
use crate::middleware::{AuthContext, Tenant};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AliasResponse {
    #[serde(flatten)]
    pub alias: RelayAlias,
    pub address: String,
}

impl From<RelayAlias> for AliasResponse {
    fn from(alias: RelayAlias) -> Self {
        let address = alias.address();
        Self { alias, address }
    }
}

#[derive(Debug, Serialize)]
pub struct AliasListResponse {
    pub domain: String,
    pub aliases: Vec<AliasResponse>,
}

#[derive(Debug, Deserialize)]
pub struct InboundRequest {
    pub recipient: String,
    #[serde(default)]
    pub is_spam: bool,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/relay/aliases", get(list_aliases).post(create_alias))
        .route(
            "/relay/aliases/{alias_id}",
            get(get_alias).put(update_alias).delete(delete_alias),
        )
}

pub fn inbound_router() -> Router<Arc<AppState>> {
    Router::new().route("/relay/inbound", post(inbound))
}

/// `GET /api/relay/aliases`
async fn list_aliases(Extension(auth): Extension<AuthContext>) -> Result<Json<AliasListResponse>, AppError> {
    let aliases = auth.locker.relay.list(auth.user.id).await?;
    Ok(Json(AliasListResponse {
        domain: auth.locker.relay.domain().to_owned(),
        aliases: aliases.into_iter().map(AliasResponse::from).collect(),
    }))
}

/// `POST /api/relay/aliases`: custom local parts need premium.
async fn create_alias(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<NewAlias>,
) -> Result<(StatusCode, Json<AliasResponse>), AppError> {
    let alias = auth.locker.create_relay_alias(auth.user.id, body).await?;
    Ok((StatusCode::CREATED, Json(alias.into())))
}

/// `GET /api/relay/aliases/{alias_id}`
async fn get_alias(
    Extension(auth): Extension<AuthContext>,
    Path(alias_id): Path<Uuid>,
) -> Result<Json<AliasResponse>, AppError> {
    let alias = auth.locker.relay.get(auth.user.id, alias_id).await?;
    Ok(Json(alias.into()))
}

/// `PUT /api/relay/aliases/{alias_id}`
async fn update_alias(
    Extension(auth): Extension<AuthContext>,
    Path(alias_id): Path<Uuid>,
    Json(body): Json<AliasUpdate>,
) -> Result<Json<AliasResponse>, AppError> {
    let alias = auth.locker.relay.update(auth.user.id, alias_id, body).await?;
    auth.record(auth.event(EventKind::RelayAliasUpdated).target(alias.id)).await;
    Ok(Json(alias.into()))
}

/// `DELETE /api/relay/aliases/{alias_id}`
async fn delete_alias(
    Extension(auth): Extension<AuthContext>,
    Path(alias_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    auth.locker.relay.delete(auth.user.id, alias_id).await?;
    auth.record(auth.event(EventKind::RelayAliasDeleted).target(alias_id)).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/relay/inbound`: where to deliver a message sent to an alias.
async fn inbound(
    Extension(Tenant(locker)): Extension<Tenant>,
    Json(body): Json<InboundRequest>,
) -> Result<Json<InboundRoute>, AppError> {
    Ok(Json(locker.relay.route_inbound(&body.recipient, body.is_spam).await?))
}
