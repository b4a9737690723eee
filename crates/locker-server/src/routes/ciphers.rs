//! Cipher routes.
//!
//! `DELETE /ciphers/{id}` is permanent; clients trash first and delete from
//! the trash.

use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use locker_core::event::{ActivityEvent, EventKind};
use locker_core::vault::{CipherOwner, CipherUpdate, CipherView, NewCipher};

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CipherListResponse {
    pub ciphers: Vec<CipherView>,
}

#[derive(Debug, Deserialize)]
pub struct CollectionsRequest {
    pub collection_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct FavoriteRequest {
    pub favorite: bool,
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub cipher_ids: Vec<Uuid>,
    /// `None` unfiles the ciphers.
    #[serde(default)]
    pub folder_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ShareRequest {
    pub team_id: Uuid,
    pub collection_ids: Vec<Uuid>,
    /// Cipher data re-encrypted under the team key.
    pub data: serde_json::Value,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ciphers", get(list_ciphers).post(create_cipher))
        .route("/ciphers/move", post(move_ciphers))
        .route(
            "/ciphers/{cipher_id}",
            get(get_cipher).put(update_cipher).delete(delete_cipher),
        )
        .route("/ciphers/{cipher_id}/trash", post(trash_cipher))
        .route("/ciphers/{cipher_id}/restore", post(restore_cipher))
        .route("/ciphers/{cipher_id}/collections", put(set_collections))
        .route("/ciphers/{cipher_id}/favorite", put(set_favorite))
        .route("/ciphers/{cipher_id}/share", post(share_cipher))
}

/// A cipher event, filed under the owning team when there is one.
fn cipher_event(auth: &AuthContext, kind: EventKind, owner: CipherOwner, cipher_id: Uuid) -> ActivityEvent {
    let event = auth.event(kind).target(cipher_id);
    match owner {
        CipherOwner::Team(team_id) => event.team(team_id),
        CipherOwner::User(_) => event,
    }
}

/// `GET /api/ciphers`: every cipher visible to the caller.
async fn list_ciphers(Extension(auth): Extension<AuthContext>) -> Result<Json<CipherListResponse>, AppError> {
    let ciphers = auth.locker.vault.list(auth.user.id).await?;
    Ok(Json(CipherListResponse { ciphers }))
}

/// `POST /api/ciphers`
async fn create_cipher(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<NewCipher>,
) -> Result<(StatusCode, Json<CipherView>), AppError> {
    let view = auth.locker.vault.create(auth.user.id, body).await?;
    auth.record(cipher_event(&auth, EventKind::CipherCreated, view.owner, view.id)).await;
    Ok((StatusCode::CREATED, Json(view)))
}

/// `GET /api/ciphers/{cipher_id}`
async fn get_cipher(
    Extension(auth): Extension<AuthContext>,
    Path(cipher_id): Path<Uuid>,
) -> Result<Json<CipherView>, AppError> {
    Ok(Json(auth.locker.vault.get(auth.user.id, cipher_id).await?))
}

/// `PUT /api/ciphers/{cipher_id}`
async fn update_cipher(
    Extension(auth): Extension<AuthContext>,
    Path(cipher_id): Path<Uuid>,
    Json(body): Json<CipherUpdate>,
) -> Result<Json<CipherView>, AppError> {
    let view = auth.locker.vault.update(auth.user.id, cipher_id, body).await?;
    auth.record(cipher_event(&auth, EventKind::CipherUpdated, view.owner, view.id)).await;
    Ok(Json(view))
}

/// `DELETE /api/ciphers/{cipher_id}`: permanent deletion.
async fn delete_cipher(
    Extension(auth): Extension<AuthContext>,
    Path(cipher_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let owner = auth.locker.vault.get(auth.user.id, cipher_id).await?.owner;
    auth.locker.vault.delete(auth.user.id, cipher_id).await?;
    auth.record(cipher_event(&auth, EventKind::CipherDeleted, owner, cipher_id)).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/ciphers/{cipher_id}/trash`
async fn trash_cipher(
    Extension(auth): Extension<AuthContext>,
    Path(cipher_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let owner = auth.locker.vault.get(auth.user.id, cipher_id).await?.owner;
    auth.locker.vault.trash(auth.user.id, cipher_id).await?;
    auth.record(cipher_event(&auth, EventKind::CipherTrashed, owner, cipher_id)).await;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/ciphers/{cipher_id}/restore`
async fn restore_cipher(
    Extension(auth): Extension<AuthContext>,
    Path(cipher_id): Path<Uuid>,
) -> Result<Json<CipherView>, AppError> {
    let view = auth.locker.vault.restore(auth.user.id, cipher_id).await?;
    auth.record(cipher_event(&auth, EventKind::CipherRestored, view.owner, view.id)).await;
    Ok(Json(view))
}

/// `PUT /api/ciphers/{cipher_id}/collections`
async fn set_collections(
    Extension(auth): Extension<AuthContext>,
    Path(cipher_id): Path<Uuid>,
    Json(body): Json<CollectionsRequest>,
) -> Result<Json<CipherView>, AppError> {
    let view = auth
        .locker
        .vault
        .set_collections(auth.user.id, cipher_id, body.collection_ids)
        .await?;
    auth.record(cipher_event(&auth, EventKind::CipherCollectionsChanged, view.owner, view.id))
        .await;
    Ok(Json(view))
}

/// `PUT /api/ciphers/{cipher_id}/favorite`: per-user, needs view access only.
async fn set_favorite(
    Extension(auth): Extension<AuthContext>,
    Path(cipher_id): Path<Uuid>,
    Json(body): Json<FavoriteRequest>,
) -> Result<Json<CipherView>, AppError> {
    let view = auth
        .locker
        .vault
        .set_favorite(auth.user.id, cipher_id, body.favorite)
        .await?;
    Ok(Json(view))
}

/// `POST /api/ciphers/move`: file ciphers into one of the caller's folders.
async fn move_ciphers(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<MoveRequest>,
) -> Result<StatusCode, AppError> {
    auth.locker
        .vault
        .move_to_folder(auth.user.id, &body.cipher_ids, body.folder_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/ciphers/{cipher_id}/share`: move a personal cipher into a team.
async fn share_cipher(
    Extension(auth): Extension<AuthContext>,
    Path(cipher_id): Path<Uuid>,
    Json(body): Json<ShareRequest>,
) -> Result<Json<CipherView>, AppError> {
    let view = auth
        .locker
        .vault
        .share(auth.user.id, cipher_id, body.team_id, body.collection_ids, body.data)
        .await?;
    auth.record(cipher_event(&auth, EventKind::CipherShared, view.owner, view.id)).await;
    Ok(Json(view))
}
