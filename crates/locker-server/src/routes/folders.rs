//! Folder routes. Folders are per-user; team ciphers can be filed too.

use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use locker_core::event::EventKind;
use locker_core::vault::Folder;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct FolderRequest {
    /// Encrypted folder name.
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct FolderListResponse {
    pub folders: Vec<Folder>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/folders", get(list_folders).post(create_folder))
        .route(
            "/folders/{folder_id}",
            get(get_folder).put(rename_folder).delete(delete_folder),
        )
}

/// `GET /api/folders`
async fn list_folders(Extension(auth): Extension<AuthContext>) -> Result<Json<FolderListResponse>, AppError> {
    let folders = auth.locker.vault.folders(auth.user.id).await?;
    Ok(Json(FolderListResponse { folders }))
}

/// `POST /api/folders`
async fn create_folder(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<FolderRequest>,
) -> Result<(StatusCode, Json<Folder>), AppError> {
    let folder = auth.locker.vault.create_folder(auth.user.id, &body.name).await?;
    auth.record(auth.event(EventKind::FolderCreated).target(folder.id)).await;
    Ok((StatusCode::CREATED, Json(folder)))
}

/// `GET /api/folders/{folder_id}`
async fn get_folder(
    Extension(auth): Extension<AuthContext>,
    Path(folder_id): Path<Uuid>,
) -> Result<Json<Folder>, AppError> {
    Ok(Json(auth.locker.vault.folder(auth.user.id, folder_id).await?))
}

/// `PUT /api/folders/{folder_id}`
async fn rename_folder(
    Extension(auth): Extension<AuthContext>,
    Path(folder_id): Path<Uuid>,
    Json(body): Json<FolderRequest>,
) -> Result<Json<Folder>, AppError> {
    let folder = auth
        .locker
        .vault
        .rename_folder(auth.user.id, folder_id, &body.name)
        .await?;
    auth.record(auth.event(EventKind::FolderUpdated).target(folder.id)).await;
    Ok(Json(folder))
}

/// `DELETE /api/folders/{folder_id}`: ciphers in it are unfiled, not deleted.
async fn delete_folder(
    Extension(auth): Extension<AuthContext>,
    Path(folder_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    auth.locker.vault.delete_folder(auth.user.id, folder_id).await?;
    auth.record(auth.event(EventKind::FolderDeleted).target(folder_id)).await;
    Ok(StatusCode::NO_CONTENT)
}
