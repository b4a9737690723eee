//! Tenant database routing.
//!
//! Each tenant alias maps to its own storage backend and service set. The
//! alias for a request comes from the request itself (a header or the
//! bearer token's `tenant` claim) and is carried with the request, never
//! stored in shared mutable state.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::TenantError;
use crate::locker::Locker;

const MAX_ALIAS_LEN: usize = 32;

/// Check that an alias matches `[a-z0-9_-]{1,32}`.
///
/// # Errors
///
/// Returns [`TenantError::InvalidAlias`] otherwise.
pub fn validate_alias(alias: &str) -> Result<(), TenantError> {
    let valid = !alias.is_empty()
        && alias.len() <= MAX_ALIAS_LEN
        && alias
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(TenantError::InvalidAlias {
            alias: alias.to_owned(),
        })
    }
}

/// Alias → service set, plus the alias used when a request names none.
pub struct TenantRouter {
    tenants: BTreeMap<String, Arc<Locker>>,
    default_alias: String,
}

impl TenantRouter {
    /// # Errors
    ///
    /// Returns [`TenantError::InvalidAlias`] for a malformed default alias.
    pub fn new(default_alias: &str) -> Result<Self, TenantError> {
        validate_alias(default_alias)?;
        Ok(Self {
            tenants: BTreeMap::new(),
            default_alias: default_alias.to_owned(),
        })
    }

    /// # Errors
    ///
    /// Returns [`TenantError::Duplicate`] if the alias is already registered.
    pub fn register(&mut self, locker: Locker) -> Result<(), TenantError> {
        let alias = locker.alias().to_owned();
        if self.tenants.contains_key(&alias) {
            return Err(TenantError::Duplicate { alias });
        }
        self.tenants.insert(alias, Arc::new(locker));
        Ok(())
    }

    /// The tenant named by `hint`, or the default tenant without one.
    ///
    /// # Errors
    ///
    /// - [`TenantError::InvalidAlias`] for a malformed hint.
    /// - [`TenantError::Unknown`] if no such tenant is registered.
    pub fn resolve(&self, hint: Option<&str>) -> Result<Arc<Locker>, TenantError> {
        let alias = match hint.map(str::trim).filter(|h| !h.is_empty()) {
            Some(alias) => {
                validate_alias(alias)?;
                alias
            }
            None => self.default_alias.as_str(),
        };
        self.tenants
            .get(alias)
            .cloned()
            .ok_or_else(|| TenantError::Unknown {
                alias: alias.to_owned(),
            })
    }

    #[must_use]
    pub fn default_alias(&self) -> &str {
        &self.default_alias
    }

    /// Every registered tenant, in alias order.
    pub fn all(&self) -> impl Iterator<Item = &Arc<Locker>> {
        self.tenants.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

impl std::fmt::Debug for TenantRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRouter")
            .field("tenants", &self.tenants.keys().collect::<Vec<_>>())
            .field("default_alias", &self.default_alias)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::locker::tests::open;

    #[test]
    fn alias_rules() {
        assert!(validate_alias("main").is_ok());
        assert!(validate_alias("eu-west_2").is_ok());
        assert!(validate_alias("").is_err());
        assert!(validate_alias("Main").is_err());
        assert!(validate_alias("a/b").is_err());
        assert!(validate_alias(&"a".repeat(33)).is_err());
    }

    #[test]
    fn resolves_hint_or_default() {
        let mut router = TenantRouter::new("main").unwrap();
        router.register(open("main")).unwrap();
        router.register(open("eu")).unwrap();

        assert_eq!(router.resolve(None).unwrap().alias(), "main");
        assert_eq!(router.resolve(Some("  ")).unwrap().alias(), "main");
        assert_eq!(router.resolve(Some("eu")).unwrap().alias(), "eu");
        assert!(matches!(router.resolve(Some("us")), Err(TenantError::Unknown { .. })));
        assert!(matches!(router.resolve(Some("../x")), Err(TenantError::InvalidAlias { .. })));
        assert_eq!(router.all().count(), 2);
    }

    #[test]
    fn duplicate_alias_rejected() {
        let mut router = TenantRouter::new("main").unwrap();
        router.register(open("main")).unwrap();
        assert!(matches!(router.register(open("main")), Err(TenantError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let mut router = TenantRouter::new("main").unwrap();
        router.register(open("main")).unwrap();
        router.register(open("eu")).unwrap();

        let main = router.resolve(Some("main")).unwrap();
        main.auth
            .register(crate::user::tests::registration("alice@example.com"))
            .await
            .unwrap();
        let eu = router.resolve(Some("eu")).unwrap();
        assert!(eu.users.find_by_email("alice@example.com").await.unwrap().is_none());
    }
}
