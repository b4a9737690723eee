//! Shared application state for the Locker server.
//!
//! A single [`AppState`] is built at startup and shared across all Axum
//! handlers via `Arc`. It holds no per-request data: the tenant a request
//! targets travels in the request's extensions.

use std::sync::Arc;

use locker_core::TenantRouter;
use locker_core::auth::JwtKeys;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Alias → tenant service set.
    pub tenants: TenantRouter,
    /// Access token keys, shared by every tenant.
    pub jwt: Arc<JwtKeys>,
    /// Secret the mail transport presents on `/api/relay/inbound`.
    pub relay_secret: Option<String>,
    /// Token for the operator endpoints.
    pub admin_token: Option<String>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("tenants", &self.tenants)
            .finish_non_exhaustive()
    }
}
