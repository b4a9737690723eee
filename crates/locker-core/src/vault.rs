//! Ciphers and folders.
//!
//! Cipher payloads are encrypted client-side (under the user key for
//! personal ciphers, under the team key for team ciphers); the server
//! treats `data` as opaque JSON. Folder placement and favourites are
//! per-user, so one team cipher can sit in different folders for
//! different members.
//!
//! Storage layout:
//!
//! - `ciphers/{cipher_id}`: [`Cipher`].
//! - `user-ciphers/{user_id}/{cipher_id}`: personal cipher index.
//! - `team-ciphers/{team_id}/{cipher_id}`: team cipher index.
//! - `folders/{user_id}/{folder_id}`: [`Folder`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::barrier::Barrier;
use crate::error::{TeamError, VaultError};
use crate::permission::{self, CipherAccess};
use crate::team::{MemberStatus, TeamService};
use crate::user::UserStore;

const CIPHER_PREFIX: &str = "ciphers/";
const USER_CIPHERS_PREFIX: &str = "user-ciphers/";
const TEAM_CIPHERS_PREFIX: &str = "team-ciphers/";
const FOLDER_PREFIX: &str = "folders/";

/// Largest accepted serialized `data` payload.
const MAX_DATA_BYTES: usize = 256 * 1024;

/// Days a trashed cipher is kept before the purge job removes it.
pub const TRASH_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherType {
    Login,
    SecureNote,
    Card,
    Identity,
    CryptoWallet,
    CryptoAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CipherOwner {
    User(Uuid),
    Team(Uuid),
}

/// A stored vault item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cipher {
    pub id: Uuid,
    pub kind: CipherType,
    pub owner: CipherOwner,
    /// Team collections holding the cipher; empty for personal ciphers.
    #[serde(default)]
    pub collection_ids: Vec<Uuid>,
    /// Client-encrypted payload.
    pub data: serde_json::Value,
    /// user id → folder id.
    #[serde(default)]
    pub folders: BTreeMap<Uuid, Uuid>,
    /// Users who starred the cipher.
    #[serde(default)]
    pub favorites: BTreeSet<Uuid>,
    #[serde(default)]
    pub reprompt: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub revision_date: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A cipher as seen by one user.
#[derive(Debug, Clone, Serialize)]
pub struct CipherView {
    pub id: Uuid,
    pub kind: CipherType,
    pub owner: CipherOwner,
    pub collection_ids: Vec<Uuid>,
    pub data: serde_json::Value,
    pub folder_id: Option<Uuid>,
    pub favorite: bool,
    pub reprompt: bool,
    pub edit: bool,
    pub view_password: bool,
    pub created_at: DateTime<Utc>,
    pub revision_date: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CipherView {
    #[must_use]
    pub fn new(cipher: &Cipher, user_id: Uuid, access: CipherAccess) -> Self {
        Self {
            id: cipher.id,
            kind: cipher.kind,
            owner: cipher.owner,
            collection_ids: cipher.collection_ids.clone(),
            data: cipher.data.clone(),
            folder_id: cipher.folders.get(&user_id).copied(),
            favorite: cipher.favorites.contains(&user_id),
            reprompt: cipher.reprompt,
            edit: access.edit,
            view_password: !access.hide_passwords,
            created_at: cipher.created_at,
            revision_date: cipher.revision_date,
            deleted_at: cipher.deleted_at,
        }
    }
}

/// Input for creating a cipher.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCipher {
    pub kind: CipherType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub folder_id: Option<Uuid>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub reprompt: bool,
    /// Create the cipher in this team instead of the personal vault.
    #[serde(default)]
    pub team_id: Option<Uuid>,
    #[serde(default)]
    pub collection_ids: Vec<Uuid>,
}

/// Input for editing a cipher's content.
#[derive(Debug, Clone, Deserialize)]
pub struct CipherUpdate {
    pub kind: CipherType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub reprompt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Encrypted under the user key.
    pub name: String,
    pub revision_date: DateTime<Utc>,
}

/// Vault operations for one tenant.
#[derive(Clone)]
pub struct VaultService {
    barrier: Arc<Barrier>,
    teams: TeamService,
    users: UserStore,
}

impl VaultService {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            teams: TeamService::new(Arc::clone(&barrier)),
            users: UserStore::new(Arc::clone(&barrier)),
            barrier,
        }
    }

    // ── Access ────────────────────────────────────────────────────────

    /// The user's access to a cipher, or `None` if it is invisible to them.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Barrier`] if storage fails.
    pub async fn access(&self, user_id: Uuid, cipher: &Cipher) -> Result<Option<CipherAccess>, VaultError> {
        match cipher.owner {
            CipherOwner::User(owner) => Ok((owner == user_id).then_some(CipherAccess::FULL)),
            CipherOwner::Team(team_id) => {
                let member = self.teams.membership(team_id, user_id).await.map_err(team_error)?;
                Ok(member.and_then(|m| permission::team_cipher_access(&m, &cipher.collection_ids)))
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if the cipher does not exist or is
    /// not visible to the user.
    pub async fn get(&self, user_id: Uuid, cipher_id: Uuid) -> Result<CipherView, VaultError> {
        let (cipher, access) = self.visible(user_id, cipher_id).await?;
        Ok(CipherView::new(&cipher, user_id, access))
    }

    /// Every cipher visible to the user, trashed ones included.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Barrier`] if storage fails.
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<CipherView>, VaultError> {
        let mut views: Vec<CipherView> = self
            .personal_ciphers(user_id)
            .await?
            .iter()
            .map(|c| CipherView::new(c, user_id, CipherAccess::FULL))
            .collect();

        for (team, member) in self.teams.teams_for_user(user_id).await.map_err(team_error)? {
            if member.status != MemberStatus::Confirmed {
                continue;
            }
            for cipher in self.indexed(&format!("{TEAM_CIPHERS_PREFIX}{}/", team.id)).await? {
                if let Some(access) = permission::team_cipher_access(&member, &cipher.collection_ids) {
                    views.push(CipherView::new(&cipher, user_id, access));
                }
            }
        }
        Ok(views)
    }

    /// A user's personal ciphers, trashed ones included.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Barrier`] if storage fails.
    pub async fn personal_ciphers(&self, user_id: Uuid) -> Result<Vec<Cipher>, VaultError> {
        self.indexed(&format!("{USER_CIPHERS_PREFIX}{user_id}/")).await
    }

    // ── Cipher lifecycle ──────────────────────────────────────────────

    /// # Errors
    ///
    /// - [`VaultError::InvalidInput`] for a malformed payload, collections on
    ///   a personal cipher, or a team cipher without collections.
    /// - [`VaultError::Forbidden`] if the user cannot write to the collections.
    /// - [`VaultError::NotFound`] for an unknown folder, team, or collection.
    pub async fn create(&self, user_id: Uuid, new: NewCipher) -> Result<CipherView, VaultError> {
        check_data(&new.data)?;
        if let Some(folder_id) = new.folder_id {
            self.folder(user_id, folder_id).await?;
        }

        let owner = match new.team_id {
            Some(team_id) => {
                self.check_team_write(user_id, team_id, &new.collection_ids).await?;
                CipherOwner::Team(team_id)
            }
            None if new.collection_ids.is_empty() => CipherOwner::User(user_id),
            None => {
                return Err(VaultError::InvalidInput {
                    reason: "personal ciphers cannot belong to collections".to_owned(),
                });
            }
        };

        let now = Utc::now();
        let mut cipher = Cipher {
            id: Uuid::new_v4(),
            kind: new.kind,
            owner,
            collection_ids: new.collection_ids,
            data: new.data,
            folders: BTreeMap::new(),
            favorites: BTreeSet::new(),
            reprompt: new.reprompt,
            created_by: user_id,
            created_at: now,
            revision_date: now,
            deleted_at: None,
        };
        if let Some(folder_id) = new.folder_id {
            cipher.folders.insert(user_id, folder_id);
        }
        if new.favorite {
            cipher.favorites.insert(user_id);
        }

        self.save(&cipher).await?;
        self.barrier.put_json(&index_key(&cipher), &true).await?;
        self.touch_affected(&cipher).await?;
        info!(cipher_id = %cipher.id, user_id = %user_id, "cipher created");

        let access = self
            .access(user_id, &cipher)
            .await?
            .unwrap_or(CipherAccess::FULL);
        Ok(CipherView::new(&cipher, user_id, access))
    }

    /// Replace a cipher's content.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if the cipher is not visible.
    /// - [`VaultError::Forbidden`] without edit access.
    pub async fn update(&self, user_id: Uuid, cipher_id: Uuid, update: CipherUpdate) -> Result<CipherView, VaultError> {
        check_data(&update.data)?;
        let (mut cipher, access) = self.editable(user_id, cipher_id).await?;
        if cipher.deleted_at.is_some() {
            return Err(VaultError::InvalidInput {
                reason: "restore the cipher before editing it".to_owned(),
            });
        }
        cipher.kind = update.kind;
        cipher.data = update.data;
        cipher.reprompt = update.reprompt;
        cipher.revision_date = Utc::now();
        self.save(&cipher).await?;
        self.touch_affected(&cipher).await?;
        Ok(CipherView::new(&cipher, user_id, access))
    }

    /// Move a team cipher to a different set of collections.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidInput`] for a personal cipher or an empty set.
    /// - [`VaultError::Forbidden`] without write access to every target.
    pub async fn set_collections(&self, user_id: Uuid, cipher_id: Uuid, collection_ids: Vec<Uuid>) -> Result<CipherView, VaultError> {
        let (mut cipher, _) = self.editable(user_id, cipher_id).await?;
        let CipherOwner::Team(team_id) = cipher.owner else {
            return Err(VaultError::InvalidInput {
                reason: "personal ciphers cannot belong to collections".to_owned(),
            });
        };
        self.check_team_write(user_id, team_id, &collection_ids).await?;

        let before = self.affected_users(&cipher).await?;
        cipher.collection_ids = collection_ids;
        cipher.revision_date = Utc::now();
        self.save(&cipher).await?;
        self.users.touch(&before).await?;
        self.touch_affected(&cipher).await?;

        let access = self
            .access(user_id, &cipher)
            .await?
            .ok_or(VaultError::NotFound { kind: "cipher", id: cipher_id })?;
        Ok(CipherView::new(&cipher, user_id, access))
    }

    /// Move a cipher to the trash.
    ///
    /// # Errors
    ///
    /// Same as [`update`](Self::update).
    pub async fn trash(&self, user_id: Uuid, cipher_id: Uuid) -> Result<(), VaultError> {
        let (mut cipher, _) = self.editable(user_id, cipher_id).await?;
        if cipher.deleted_at.is_none() {
            let now = Utc::now();
            cipher.deleted_at = Some(now);
            cipher.revision_date = now;
            self.save(&cipher).await?;
            self.touch_affected(&cipher).await?;
        }
        Ok(())
    }

    /// Take a cipher out of the trash.
    ///
    /// # Errors
    ///
    /// Same as [`update`](Self::update).
    pub async fn restore(&self, user_id: Uuid, cipher_id: Uuid) -> Result<CipherView, VaultError> {
        let (mut cipher, access) = self.editable(user_id, cipher_id).await?;
        if cipher.deleted_at.is_some() {
            cipher.deleted_at = None;
            cipher.revision_date = Utc::now();
            self.save(&cipher).await?;
            self.touch_affected(&cipher).await?;
        }
        Ok(CipherView::new(&cipher, user_id, access))
    }

    /// Delete a cipher permanently.
    ///
    /// # Errors
    ///
    /// Same as [`update`](Self::update).
    pub async fn delete(&self, user_id: Uuid, cipher_id: Uuid) -> Result<(), VaultError> {
        let (cipher, _) = self.editable(user_id, cipher_id).await?;
        let affected = self.affected_users(&cipher).await?;
        self.remove(&cipher).await?;
        self.users.touch(&affected).await?;
        info!(cipher_id = %cipher_id, user_id = %user_id, "cipher deleted");
        Ok(())
    }

    /// File ciphers into a folder, or unfile them with `None`. Needs only
    /// view access: folder placement is per-user.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] for an unknown folder or an
    /// invisible cipher.
    pub async fn move_to_folder(&self, user_id: Uuid, cipher_ids: &[Uuid], folder_id: Option<Uuid>) -> Result<(), VaultError> {
        if let Some(folder_id) = folder_id {
            self.folder(user_id, folder_id).await?;
        }
        for cipher_id in cipher_ids {
            let (mut cipher, _) = self.visible(user_id, *cipher_id).await?;
            match folder_id {
                Some(folder_id) => cipher.folders.insert(user_id, folder_id),
                None => cipher.folders.remove(&user_id),
            };
            self.save(&cipher).await?;
        }
        self.users.touch(&[user_id]).await?;
        Ok(())
    }

    /// Star or unstar a cipher for the user.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if the cipher is not visible.
    pub async fn set_favorite(&self, user_id: Uuid, cipher_id: Uuid, favorite: bool) -> Result<CipherView, VaultError> {
        let (mut cipher, access) = self.visible(user_id, cipher_id).await?;
        if favorite {
            cipher.favorites.insert(user_id);
        } else {
            cipher.favorites.remove(&user_id);
        }
        self.save(&cipher).await?;
        self.users.touch(&[user_id]).await?;
        Ok(CipherView::new(&cipher, user_id, access))
    }

    /// Move a personal cipher into a team. The client re-encrypts `data`
    /// under the team key.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Forbidden`] if the cipher is not the user's own.
    /// - [`VaultError::Forbidden`] without write access to the collections.
    pub async fn share(
        &self,
        user_id: Uuid,
        cipher_id: Uuid,
        team_id: Uuid,
        collection_ids: Vec<Uuid>,
        data: serde_json::Value,
    ) -> Result<CipherView, VaultError> {
        check_data(&data)?;
        let (mut cipher, _) = self.visible(user_id, cipher_id).await?;
        if cipher.owner != CipherOwner::User(user_id) {
            return Err(VaultError::Forbidden {
                reason: "only personal ciphers can be shared".to_owned(),
            });
        }
        self.check_team_write(user_id, team_id, &collection_ids).await?;

        self.barrier.delete(&index_key(&cipher)).await?;
        cipher.owner = CipherOwner::Team(team_id);
        cipher.collection_ids = collection_ids;
        cipher.data = data;
        cipher.revision_date = Utc::now();
        self.save(&cipher).await?;
        self.barrier.put_json(&index_key(&cipher), &true).await?;
        self.touch_affected(&cipher).await?;
        info!(cipher_id = %cipher_id, team_id = %team_id, "cipher shared with team");

        let access = self
            .access(user_id, &cipher)
            .await?
            .unwrap_or(CipherAccess::READ_ONLY);
        Ok(CipherView::new(&cipher, user_id, access))
    }

    // ── Folders ───────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns [`VaultError::InvalidInput`] for an empty name.
    pub async fn create_folder(&self, user_id: Uuid, name: &str) -> Result<Folder, VaultError> {
        let folder = Folder {
            id: Uuid::new_v4(),
            user_id,
            name: folder_name(name)?,
            revision_date: Utc::now(),
        };
        self.save_folder(&folder).await?;
        self.users.touch(&[user_id]).await?;
        Ok(folder)
    }

    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if the folder does not exist.
    pub async fn folder(&self, user_id: Uuid, folder_id: Uuid) -> Result<Folder, VaultError> {
        self.barrier
            .get_json(&format!("{FOLDER_PREFIX}{user_id}/{folder_id}"))
            .await?
            .ok_or(VaultError::NotFound { kind: "folder", id: folder_id })
    }

    /// # Errors
    ///
    /// Returns [`VaultError::Barrier`] if storage fails.
    pub async fn folders(&self, user_id: Uuid) -> Result<Vec<Folder>, VaultError> {
        Ok(self.barrier.values_json(&format!("{FOLDER_PREFIX}{user_id}/")).await?)
    }

    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if the folder does not exist.
    /// - [`VaultError::InvalidInput`] for an empty name.
    pub async fn rename_folder(&self, user_id: Uuid, folder_id: Uuid, name: &str) -> Result<Folder, VaultError> {
        let mut folder = self.folder(user_id, folder_id).await?;
        folder.name = folder_name(name)?;
        folder.revision_date = Utc::now();
        self.save_folder(&folder).await?;
        self.users.touch(&[user_id]).await?;
        Ok(folder)
    }

    /// Delete a folder. Its ciphers stay, unfiled.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] if the folder does not exist.
    pub async fn delete_folder(&self, user_id: Uuid, folder_id: Uuid) -> Result<(), VaultError> {
        self.folder(user_id, folder_id).await?;
        for view in self.list(user_id).await? {
            if view.folder_id != Some(folder_id) {
                continue;
            }
            if let Some(mut cipher) = self.load(view.id).await? {
                cipher.folders.remove(&user_id);
                self.save(&cipher).await?;
            }
        }
        self.barrier
            .delete(&format!("{FOLDER_PREFIX}{user_id}/{folder_id}"))
            .await?;
        self.users.touch(&[user_id]).await?;
        Ok(())
    }

    // ── Maintenance ───────────────────────────────────────────────────

    /// Permanently delete ciphers trashed longer than `retention`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Barrier`] if storage fails.
    pub async fn purge_trash(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize, VaultError> {
        let mut purged = 0usize;
        for cipher in self.barrier.values_json::<Cipher>(CIPHER_PREFIX).await? {
            if cipher.deleted_at.is_some_and(|at| at + retention <= now) {
                self.remove(&cipher).await?;
                purged = purged.saturating_add(1);
            }
        }
        Ok(purged)
    }

    /// Delete a user's personal ciphers and folders.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Barrier`] if storage fails.
    pub async fn purge_user(&self, user_id: Uuid) -> Result<usize, VaultError> {
        let ciphers = self.personal_ciphers(user_id).await?;
        for cipher in &ciphers {
            self.remove(cipher).await?;
        }
        self.barrier.delete_prefix(&format!("{FOLDER_PREFIX}{user_id}/")).await?;
        Ok(ciphers.len())
    }

    /// Delete every cipher of a team.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Barrier`] if storage fails.
    pub async fn purge_team(&self, team_id: Uuid) -> Result<usize, VaultError> {
        let ciphers = self.indexed(&format!("{TEAM_CIPHERS_PREFIX}{team_id}/")).await?;
        for cipher in &ciphers {
            self.remove(cipher).await?;
        }
        Ok(ciphers.len())
    }

    /// Drop a deleted collection from every team cipher referencing it.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Barrier`] if storage fails.
    pub async fn forget_collection(&self, team_id: Uuid, collection_id: Uuid) -> Result<(), VaultError> {
        for mut cipher in self.indexed(&format!("{TEAM_CIPHERS_PREFIX}{team_id}/")).await? {
            if cipher.collection_ids.contains(&collection_id) {
                cipher.collection_ids.retain(|id| *id != collection_id);
                cipher.revision_date = Utc::now();
                self.save(&cipher).await?;
            }
        }
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn load(&self, cipher_id: Uuid) -> Result<Option<Cipher>, VaultError> {
        Ok(self.barrier.get_json(&format!("{CIPHER_PREFIX}{cipher_id}")).await?)
    }

    async fn visible(&self, user_id: Uuid, cipher_id: Uuid) -> Result<(Cipher, CipherAccess), VaultError> {
        let not_found = VaultError::NotFound { kind: "cipher", id: cipher_id };
        let Some(cipher) = self.load(cipher_id).await? else {
            return Err(not_found);
        };
        match self.access(user_id, &cipher).await? {
            Some(access) if access.view => Ok((cipher, access)),
            _ => Err(not_found),
        }
    }

    async fn editable(&self, user_id: Uuid, cipher_id: Uuid) -> Result<(Cipher, CipherAccess), VaultError> {
        let (cipher, access) = self.visible(user_id, cipher_id).await?;
        if access.edit {
            Ok((cipher, access))
        } else {
            Err(VaultError::Forbidden {
                reason: "read-only access to this cipher".to_owned(),
            })
        }
    }

    async fn check_team_write(&self, user_id: Uuid, team_id: Uuid, collection_ids: &[Uuid]) -> Result<(), VaultError> {
        if collection_ids.is_empty() {
            return Err(VaultError::InvalidInput {
                reason: "team ciphers need at least one collection".to_owned(),
            });
        }
        let member = self.teams.confirmed_member(team_id, user_id).await.map_err(team_error)?;
        for collection_id in collection_ids {
            self.teams
                .collection(team_id, *collection_id)
                .await
                .map_err(team_error)?;
        }
        if permission::can_write_collections(&member, collection_ids) {
            Ok(())
        } else {
            Err(VaultError::Forbidden {
                reason: "no write access to every target collection".to_owned(),
            })
        }
    }

    async fn indexed(&self, prefix: &str) -> Result<Vec<Cipher>, VaultError> {
        let mut out = Vec::new();
        for key in self.barrier.list(prefix).await? {
            let Some(id) = key.strip_prefix(prefix).and_then(|id| Uuid::parse_str(id).ok()) else {
                continue;
            };
            if let Some(cipher) = self.load(id).await? {
                out.push(cipher);
            }
        }
        Ok(out)
    }

    async fn affected_users(&self, cipher: &Cipher) -> Result<Vec<Uuid>, VaultError> {
        match cipher.owner {
            CipherOwner::User(user_id) => Ok(vec![user_id]),
            CipherOwner::Team(team_id) => self.teams.confirmed_user_ids(team_id).await.map_err(team_error),
        }
    }

    async fn touch_affected(&self, cipher: &Cipher) -> Result<(), VaultError> {
        let users = self.affected_users(cipher).await?;
        self.users.touch(&users).await?;
        Ok(())
    }

    async fn save(&self, cipher: &Cipher) -> Result<(), VaultError> {
        self.barrier
            .put_json(&format!("{CIPHER_PREFIX}{}", cipher.id), cipher)
            .await?;
        Ok(())
    }

    async fn remove(&self, cipher: &Cipher) -> Result<(), VaultError> {
        self.barrier.delete(&index_key(cipher)).await?;
        self.barrier.delete(&format!("{CIPHER_PREFIX}{}", cipher.id)).await?;
        Ok(())
    }

    async fn save_folder(&self, folder: &Folder) -> Result<(), VaultError> {
        self.barrier
            .put_json(&format!("{FOLDER_PREFIX}{}/{}", folder.user_id, folder.id), folder)
            .await?;
        Ok(())
    }
}

fn index_key(cipher: &Cipher) -> String {
    match cipher.owner {
        CipherOwner::User(user_id) => format!("{USER_CIPHERS_PREFIX}{user_id}/{}", cipher.id),
        CipherOwner::Team(team_id) => format!("{TEAM_CIPHERS_PREFIX}{team_id}/{}", cipher.id),
    }
}

fn check_data(data: &serde_json::Value) -> Result<(), VaultError> {
    if !data.is_object() {
        return Err(VaultError::InvalidInput {
            reason: "cipher data must be a JSON object".to_owned(),
        });
    }
    let size = serde_json::to_vec(data).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > MAX_DATA_BYTES {
        return Err(VaultError::InvalidInput {
            reason: format!("cipher data exceeds {MAX_DATA_BYTES} bytes"),
        });
    }
    Ok(())
}

fn folder_name(name: &str) -> Result<String, VaultError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(VaultError::InvalidInput {
            reason: "folder name must not be empty".to_owned(),
        });
    }
    Ok(name.to_owned())
}

fn team_error(e: TeamError) -> VaultError {
    match e {
        TeamError::NotFound { kind, id } => VaultError::NotFound { kind, id },
        TeamError::Forbidden { reason } => VaultError::Forbidden { reason },
        TeamError::Barrier(e) => VaultError::Barrier(e),
        other => VaultError::InvalidInput {
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::team::{CollectionAccess, Invitation, NewTeam, Team, TeamRole};
    use crate::user::User;
    use crate::user::tests::{barrier, registration};

    struct Fixture {
        vault: VaultService,
        teams: TeamService,
        users: UserStore,
        owner: User,
        team: Team,
        collection: Uuid,
    }

    async fn fixture() -> Fixture {
        let barrier = barrier();
        let users = UserStore::new(Arc::clone(&barrier));
        let teams = TeamService::new(Arc::clone(&barrier));
        let vault = VaultService::new(Arc::clone(&barrier));
        let owner = users.create(registration("owner@example.com")).await.unwrap();
        let (team, _) = teams
            .create(
                &owner,
                NewTeam {
                    name: "Acme".to_owned(),
                    billing_email: "owner@example.com".to_owned(),
                    owner_key: "k".to_owned(),
                    collection_name: None,
                },
            )
            .await
            .unwrap();
        teams.set_seats(team.id, 10).await.unwrap();
        let collection = teams
            .create_collection(owner.id, team.id, "Shared".to_owned(), None)
            .await
            .unwrap()
            .id;
        Fixture {
            vault,
            teams,
            users,
            owner,
            team,
            collection,
        }
    }

    impl Fixture {
        async fn member(&self, email: &str, read_only: bool, hide_passwords: bool) -> User {
            let user = self.users.create(registration(email)).await.unwrap();
            let invited = self
                .teams
                .invite(
                    self.owner.id,
                    self.team.id,
                    Invitation {
                        email: email.to_owned(),
                        role: TeamRole::Member,
                        grants: Vec::new(),
                    },
                )
                .await
                .unwrap();
            self.teams.accept(&user, self.team.id, invited.id).await.unwrap();
            self.teams
                .confirm(self.owner.id, self.team.id, invited.id, "k".to_owned())
                .await
                .unwrap();
            self.teams
                .set_collection_access(
                    self.owner.id,
                    self.team.id,
                    self.collection,
                    &[CollectionAccess {
                        member_id: invited.id,
                        read_only,
                        hide_passwords,
                    }],
                )
                .await
                .unwrap();
            user
        }

        async fn team_cipher(&self) -> CipherView {
            self.vault
                .create(
                    self.owner.id,
                    NewCipher {
                        kind: CipherType::Login,
                        data: json!({"name": "2.enc"}),
                        folder_id: None,
                        favorite: false,
                        reprompt: false,
                        team_id: Some(self.team.id),
                        collection_ids: vec![self.collection],
                    },
                )
                .await
                .unwrap()
        }
    }

    fn personal(data: serde_json::Value) -> NewCipher {
        NewCipher {
            kind: CipherType::SecureNote,
            data,
            folder_id: None,
            favorite: false,
            reprompt: false,
            team_id: None,
            collection_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn personal_ciphers_are_private() {
        let f = fixture().await;
        let other = f.users.create(registration("other@example.com")).await.unwrap();
        let view = f.vault.create(f.owner.id, personal(json!({"n": 1}))).await.unwrap();

        assert!(view.edit);
        assert!(matches!(
            f.vault.get(other.id, view.id).await,
            Err(VaultError::NotFound { .. })
        ));
        assert!(f.vault.list(other.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_object_data_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.vault.create(f.owner.id, personal(json!("plain"))).await,
            Err(VaultError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn read_only_member_sees_but_cannot_edit() {
        let f = fixture().await;
        let member = f.member("m@example.com", true, true).await;
        let cipher = f.team_cipher().await;

        let view = f.vault.get(member.id, cipher.id).await.unwrap();
        assert!(!view.edit);
        assert!(!view.view_password);
        assert!(matches!(
            f.vault.trash(member.id, cipher.id).await,
            Err(VaultError::Forbidden { .. })
        ));
        // Folder placement is per-user and needs only view access.
        let folder = f.vault.create_folder(member.id, "Work").await.unwrap();
        f.vault
            .move_to_folder(member.id, &[cipher.id], Some(folder.id))
            .await
            .unwrap();
        assert_eq!(f.vault.get(member.id, cipher.id).await.unwrap().folder_id, Some(folder.id));
        assert_eq!(f.vault.get(f.owner.id, cipher.id).await.unwrap().folder_id, None);
    }

    #[tokio::test]
    async fn writable_member_edits_and_bumps_revisions() {
        let f = fixture().await;
        let member = f.member("m@example.com", false, false).await;
        let cipher = f.team_cipher().await;
        let before = f.users.require(f.owner.id).await.unwrap().revision_date;

        f.vault
            .update(
                member.id,
                cipher.id,
                CipherUpdate {
                    kind: CipherType::Login,
                    data: json!({"name": "2.changed"}),
                    reprompt: true,
                },
            )
            .await
            .unwrap();
        assert!(f.users.require(f.owner.id).await.unwrap().revision_date >= before);
        assert_eq!(f.vault.get(f.owner.id, cipher.id).await.unwrap().data, json!({"name": "2.changed"}));
    }

    #[tokio::test]
    async fn member_cannot_create_in_ungranted_collection() {
        let f = fixture().await;
        let member = f.member("m@example.com", false, false).await;
        let other = f
            .teams
            .create_collection(f.owner.id, f.team.id, "Secret".to_owned(), None)
            .await
            .unwrap();
        let mut new = personal(json!({}));
        new.team_id = Some(f.team.id);
        new.collection_ids = vec![other.id];
        assert!(matches!(
            f.vault.create(member.id, new).await,
            Err(VaultError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn trash_restore_and_purge() {
        let f = fixture().await;
        let view = f.vault.create(f.owner.id, personal(json!({}))).await.unwrap();
        f.vault.trash(f.owner.id, view.id).await.unwrap();
        assert!(f.vault.get(f.owner.id, view.id).await.unwrap().deleted_at.is_some());

        f.vault.restore(f.owner.id, view.id).await.unwrap();
        assert!(f.vault.get(f.owner.id, view.id).await.unwrap().deleted_at.is_none());

        f.vault.trash(f.owner.id, view.id).await.unwrap();
        let retention = Duration::days(TRASH_RETENTION_DAYS);
        assert_eq!(f.vault.purge_trash(Utc::now(), retention).await.unwrap(), 0);
        assert_eq!(
            f.vault
                .purge_trash(Utc::now() + Duration::days(31), retention)
                .await
                .unwrap(),
            1
        );
        assert!(f.vault.list(f.owner.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn share_moves_cipher_into_team() {
        let f = fixture().await;
        let member = f.member("m@example.com", true, false).await;
        let view = f.vault.create(f.owner.id, personal(json!({}))).await.unwrap();
        assert!(f.vault.get(member.id, view.id).await.is_err());

        let shared = f
            .vault
            .share(f.owner.id, view.id, f.team.id, vec![f.collection], json!({"team": true}))
            .await
            .unwrap();
        assert_eq!(shared.owner, CipherOwner::Team(f.team.id));
        assert!(f.vault.personal_ciphers(f.owner.id).await.unwrap().is_empty());
        assert!(f.vault.get(member.id, view.id).await.is_ok());
    }

    #[tokio::test]
    async fn deleting_folder_unfiles_ciphers() {
        let f = fixture().await;
        let folder = f.vault.create_folder(f.owner.id, "Bank").await.unwrap();
        let mut new = personal(json!({}));
        new.folder_id = Some(folder.id);
        new.favorite = true;
        let view = f.vault.create(f.owner.id, new).await.unwrap();
        assert_eq!(view.folder_id, Some(folder.id));
        assert!(view.favorite);

        f.vault.delete_folder(f.owner.id, folder.id).await.unwrap();
        assert!(f.vault.folders(f.owner.id).await.unwrap().is_empty());
        assert_eq!(f.vault.get(f.owner.id, view.id).await.unwrap().folder_id, None);
    }

    #[tokio::test]
    async fn unknown_folder_rejected() {
        let f = fixture().await;
        let mut new = personal(json!({}));
        new.folder_id = Some(Uuid::new_v4());
        assert!(matches!(
            f.vault.create(f.owner.id, new).await,
            Err(VaultError::NotFound { kind: "folder", .. })
        ));
    }
}
