//! E-mail relay aliases.
//!
//! An alias is an address on the relay domain that forwards to the
//! owner's account e-mail. The mail transport itself lives outside this
//! crate: it calls [`RelayService::route_inbound`] for each recipient and
//! delivers or drops the message based on the answer.
//!
//! Storage layout:
//!
//! - `relay/aliases/{alias_id}`: [`RelayAlias`].
//! - `relay/addresses/{address_index}`: alias id, keyed by blind index of
//!   the full address.
//! - `relay/user/{user_id}/{alias_id}`: per-user index.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::barrier::Barrier;
use crate::error::{AccountError, BarrierError, RelayError};
use crate::user::UserStore;

const ALIAS_PREFIX: &str = "relay/aliases/";
const ADDRESS_PREFIX: &str = "relay/addresses/";
const USER_ALIAS_PREFIX: &str = "relay/user/";

/// Aliases a user without premium features may hold.
pub const FREE_RELAY_ALIASES: u32 = 5;

const GENERATE_ATTEMPTS: usize = 8;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusty", "eager", "fuzzy", "gentle", "hollow", "icy", "jolly", "keen", "lucky",
    "mellow", "nimble", "olive", "quiet", "rapid", "silver", "tidy", "vivid", "witty", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "anchor", "badger", "canyon", "dune", "ember", "falcon", "garden", "harbor", "island", "jungle", "kettle",
    "lantern", "meadow", "nectar", "orchid", "pebble", "quartz", "river", "summit", "tundra", "walrus", "yarrow",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAlias {
    pub id: Uuid,
    pub user_id: Uuid,
    pub local_part: String,
    pub domain: String,
    pub description: Option<String>,
    pub enabled: bool,
    /// Drop messages the transport flags as spam.
    pub block_spam: bool,
    pub forwarded: u64,
    pub blocked: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RelayAlias {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}@{}", self.local_part, self.domain)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAlias {
    /// Custom local part; generated when absent.
    #[serde(default)]
    pub local_part: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AliasUpdate {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub block_spam: Option<bool>,
}

/// What the transport should do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboundRoute {
    Forward { to: String, alias_id: Uuid },
    Reject { reason: String },
}

#[derive(Clone)]
pub struct RelayService {
    barrier: Arc<Barrier>,
    users: UserStore,
    domain: String,
}

impl RelayService {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, domain: &str) -> Self {
        Self {
            users: UserStore::new(Arc::clone(&barrier)),
            barrier,
            domain: domain.trim().to_ascii_lowercase(),
        }
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Create an alias. `premium` lifts the alias limit and unlocks custom
    /// local parts.
    ///
    /// # Errors
    ///
    /// - [`RelayError::LimitReached`] once a free account holds
    ///   [`FREE_RELAY_ALIASES`] aliases.
    /// - [`RelayError::NotEntitled`] for a custom local part without premium.
    /// - [`RelayError::InvalidInput`] for a malformed local part.
    /// - [`RelayError::AddressTaken`] if the custom address is in use.
    pub async fn create(&self, user_id: Uuid, new: NewAlias, premium: bool) -> Result<RelayAlias, RelayError> {
        if !premium {
            let held = self.barrier.list(&user_index(user_id)).await?.len();
            if held >= FREE_RELAY_ALIASES as usize {
                return Err(RelayError::LimitReached {
                    limit: FREE_RELAY_ALIASES,
                });
            }
        }

        let local_part = match new.local_part {
            Some(custom) => {
                if !premium {
                    return Err(RelayError::NotEntitled);
                }
                let custom = validate_local_part(&custom)?;
                if self.lookup(&self.address(&custom)).await?.is_some() {
                    return Err(RelayError::AddressTaken);
                }
                custom
            }
            None => self.generate_unused().await?,
        };

        let now = Utc::now();
        let alias = RelayAlias {
            id: Uuid::new_v4(),
            user_id,
            local_part,
            domain: self.domain.clone(),
            description: new.description,
            enabled: true,
            block_spam: true,
            forwarded: 0,
            blocked: 0,
            created_at: now,
            updated_at: now,
        };
        self.save(&alias).await?;
        self.barrier
            .put_json(&self.address_key(&alias.address()), &alias.id)
            .await?;
        self.barrier
            .put_json(&format!("{}{}", user_index(user_id), alias.id), &true)
            .await?;
        info!(alias_id = %alias.id, user_id = %user_id, "relay alias created");
        Ok(alias)
    }

    /// # Errors
    ///
    /// Returns [`RelayError::Barrier`] if storage fails.
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<RelayAlias>, RelayError> {
        let prefix = user_index(user_id);
        let mut aliases = Vec::new();
        for key in self.barrier.list(&prefix).await? {
            let Some(id) = key.strip_prefix(&prefix).and_then(|id| Uuid::parse_str(id).ok()) else {
                continue;
            };
            if let Some(alias) = self.load(id).await? {
                aliases.push(alias);
            }
        }
        aliases.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(aliases)
    }

    /// # Errors
    ///
    /// Returns [`RelayError::NotFound`] if the alias does not exist or
    /// belongs to another user.
    pub async fn get(&self, user_id: Uuid, alias_id: Uuid) -> Result<RelayAlias, RelayError> {
        match self.load(alias_id).await? {
            Some(alias) if alias.user_id == user_id => Ok(alias),
            _ => Err(RelayError::NotFound { id: alias_id }),
        }
    }

    /// # Errors
    ///
    /// Returns [`RelayError::NotFound`] if the alias is not the user's.
    pub async fn update(&self, user_id: Uuid, alias_id: Uuid, update: AliasUpdate) -> Result<RelayAlias, RelayError> {
        let mut alias = self.get(user_id, alias_id).await?;
        if let Some(description) = update.description {
            alias.description = Some(description).filter(|d| !d.trim().is_empty());
        }
        if let Some(enabled) = update.enabled {
            alias.enabled = enabled;
        }
        if let Some(block_spam) = update.block_spam {
            alias.block_spam = block_spam;
        }
        alias.updated_at = Utc::now();
        self.save(&alias).await?;
        Ok(alias)
    }

    /// Delete an alias. Its address becomes available again.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotFound`] if the alias is not the user's.
    pub async fn delete(&self, user_id: Uuid, alias_id: Uuid) -> Result<(), RelayError> {
        let alias = self.get(user_id, alias_id).await?;
        self.remove(&alias).await?;
        info!(alias_id = %alias_id, user_id = %user_id, "relay alias deleted");
        Ok(())
    }

    /// Delete every alias a user holds.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Barrier`] if storage fails.
    pub async fn delete_all_for(&self, user_id: Uuid) -> Result<usize, RelayError> {
        let aliases = self.list(user_id).await?;
        for alias in &aliases {
            self.remove(alias).await?;
        }
        Ok(aliases.len())
    }

    /// Decide what happens to a message addressed to `recipient`, and count
    /// it against the alias.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Barrier`] if storage fails. Unknown addresses
    /// are a [`InboundRoute::Reject`], not an error.
    pub async fn route_inbound(&self, recipient: &str, is_spam: bool) -> Result<InboundRoute, RelayError> {
        let address = recipient.trim().to_ascii_lowercase();
        let Some(mut alias) = self.lookup(&address).await? else {
            debug!("inbound mail for unknown relay address");
            return Ok(reject("unknown address"));
        };

        let verdict = if !alias.enabled {
            Err("alias disabled")
        } else if is_spam && alias.block_spam {
            Err("spam blocked")
        } else {
            match self.users.get(alias.user_id).await {
                Ok(Some(user)) => Ok(user.email),
                Ok(None) => Err("owner no longer exists"),
                Err(AccountError::Barrier(e)) => return Err(RelayError::Barrier(e)),
                Err(AccountError::Crypto(e)) => return Err(RelayError::Barrier(BarrierError::Crypto(e))),
                Err(e) => {
                    return Err(RelayError::InvalidInput {
                        reason: e.to_string(),
                    });
                }
            }
        };

        let route = match verdict {
            Ok(to) => {
                alias.forwarded = alias.forwarded.saturating_add(1);
                InboundRoute::Forward { to, alias_id: alias.id }
            }
            Err(reason) => {
                alias.blocked = alias.blocked.saturating_add(1);
                reject(reason)
            }
        };
        self.save(&alias).await?;
        Ok(route)
    }

    fn address(&self, local_part: &str) -> String {
        format!("{local_part}@{}", self.domain)
    }

    fn address_key(&self, address: &str) -> String {
        format!("{ADDRESS_PREFIX}{}", self.barrier.blind_index(address))
    }

    async fn lookup(&self, address: &str) -> Result<Option<RelayAlias>, RelayError> {
        let Some(id) = self.barrier.get_json::<Uuid>(&self.address_key(address)).await? else {
            return Ok(None);
        };
        self.load(id).await
    }

    async fn generate_unused(&self) -> Result<String, RelayError> {
        for _ in 0..GENERATE_ATTEMPTS {
            let candidate = generate_local_part();
            if self.lookup(&self.address(&candidate)).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(RelayError::AddressTaken)
    }

    async fn load(&self, alias_id: Uuid) -> Result<Option<RelayAlias>, RelayError> {
        Ok(self.barrier.get_json(&format!("{ALIAS_PREFIX}{alias_id}")).await?)
    }

    async fn save(&self, alias: &RelayAlias) -> Result<(), RelayError> {
        self.barrier
            .put_json(&format!("{ALIAS_PREFIX}{}", alias.id), alias)
            .await?;
        Ok(())
    }

    async fn remove(&self, alias: &RelayAlias) -> Result<(), RelayError> {
        self.barrier.delete(&self.address_key(&alias.address())).await?;
        self.barrier
            .delete(&format!("{}{}", user_index(alias.user_id), alias.id))
            .await?;
        self.barrier.delete(&format!("{ALIAS_PREFIX}{}", alias.id)).await?;
        Ok(())
    }
}

fn user_index(user_id: Uuid) -> String {
    format!("{USER_ALIAS_PREFIX}{user_id}/")
}

fn reject(reason: &str) -> InboundRoute {
    InboundRoute::Reject {
        reason: reason.to_owned(),
    }
}

/// `adjective_noun###`, e.g. `brisk_walrus042`.
fn generate_local_part() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("river");
    let number: u16 = rng.gen_range(0..1000);
    format!("{adjective}_{noun}{number:03}")
}

fn validate_local_part(raw: &str) -> Result<String, RelayError> {
    let local = raw.trim().to_ascii_lowercase();
    let valid_chars = local
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    let edges_ok = !local.starts_with('.') && !local.ends_with('.');
    if !(3..=64).contains(&local.len()) || !valid_chars || !edges_ok {
        return Err(RelayError::InvalidInput {
            reason: "local part must be 3-64 characters of a-z, 0-9, '.', '_' or '-'".to_owned(),
        });
    }
    Ok(local)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::user::tests::{barrier, flaky_barrier, registration};

    async fn setup() -> (RelayService, Uuid) {
        setup_on(barrier()).await
    }

    async fn setup_on(barrier: Arc<Barrier>) -> (RelayService, Uuid) {
        let users = UserStore::new(Arc::clone(&barrier));
        let user = users.create(registration("alice@example.com")).await.unwrap();
        (RelayService::new(barrier, "Relay.Example"), user.id)
    }

    #[test]
    fn generated_local_parts_are_valid() {
        for _ in 0..50 {
            let local = generate_local_part();
            assert!(validate_local_part(&local).is_ok(), "{local}");
            assert!(local.contains('_'));
        }
    }

    #[test]
    fn local_part_rules() {
        assert_eq!(validate_local_part(" Shop.Alerts ").unwrap(), "shop.alerts");
        assert!(validate_local_part("ab").is_err());
        assert!(validate_local_part("has space").is_err());
        assert!(validate_local_part(".dot").is_err());
        assert!(validate_local_part(&"x".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn free_users_are_capped() {
        let (relay, user) = setup().await;
        for _ in 0..FREE_RELAY_ALIASES {
            relay.create(user, NewAlias::default(), false).await.unwrap();
        }
        assert!(matches!(
            relay.create(user, NewAlias::default(), false).await,
            Err(RelayError::LimitReached { limit: FREE_RELAY_ALIASES })
        ));
        relay.create(user, NewAlias::default(), true).await.unwrap();
        assert_eq!(relay.list(user).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn custom_addresses_need_premium_and_are_unique() {
        let (relay, user) = setup().await;
        let custom = NewAlias {
            local_part: Some("shopping".to_owned()),
            description: None,
        };
        assert!(matches!(
            relay.create(user, custom.clone(), false).await,
            Err(RelayError::NotEntitled)
        ));
        let alias = relay.create(user, custom.clone(), true).await.unwrap();
        assert_eq!(alias.address(), "shopping@relay.example");
        assert!(matches!(relay.create(user, custom, true).await, Err(RelayError::AddressTaken)));
    }

    #[tokio::test]
    async fn inbound_routing_counts_and_filters() {
        let (relay, user) = setup().await;
        let alias = relay.create(user, NewAlias::default(), false).await.unwrap();
        let address = alias.address().to_uppercase();

        assert_eq!(
            relay.route_inbound(&address, false).await.unwrap(),
            InboundRoute::Forward {
                to: "alice@example.com".to_owned(),
                alias_id: alias.id
            }
        );
        assert!(matches!(
            relay.route_inbound(&address, true).await.unwrap(),
            InboundRoute::Reject { .. }
        ));

        relay
            .update(
                user,
                alias.id,
                AliasUpdate {
                    enabled: Some(false),
                    ..AliasUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            relay.route_inbound(&address, false).await.unwrap(),
            InboundRoute::Reject { .. }
        ));

        let stored = relay.get(user, alias.id).await.unwrap();
        assert_eq!(stored.forwarded, 1);
        assert_eq!(stored.blocked, 2);
        assert!(matches!(
            relay.route_inbound("nobody@relay.example", false).await.unwrap(),
            InboundRoute::Reject { .. }
        ));
    }

    #[tokio::test]
    async fn inbound_storage_failure_is_not_a_bad_request() {
        let (backend, barrier) = flaky_barrier();
        let (relay, user) = setup_on(barrier).await;
        let alias = relay.create(user, NewAlias::default(), false).await.unwrap();

        backend.fail_reads_under("users/");
        assert!(matches!(
            relay.route_inbound(&alias.address(), false).await,
            Err(RelayError::Barrier(BarrierError::Storage(_)))
        ));
    }

    #[tokio::test]
    async fn delete_frees_address_and_hides_from_others() {
        let (relay, user) = setup().await;
        let alias = relay
            .create(
                user,
                NewAlias {
                    local_part: Some("news".to_owned()),
                    description: Some("newsletters".to_owned()),
                },
                true,
            )
            .await
            .unwrap();
        assert!(matches!(
            relay.delete(Uuid::new_v4(), alias.id).await,
            Err(RelayError::NotFound { .. })
        ));
        relay.delete(user, alias.id).await.unwrap();
        assert!(matches!(
            relay.route_inbound("news@relay.example", false).await.unwrap(),
            InboundRoute::Reject { .. }
        ));
        assert_eq!(relay.delete_all_for(user).await.unwrap(), 0);
    }
}
