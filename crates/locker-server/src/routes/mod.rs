//! HTTP route handlers.
//!
//! Everything is nested under `/api`. Four groups, each with its own gate:
//!
//! - public: health, registration, prelogin, login and refresh; the tenant
//!   comes from `X-Locker-Tenant` or the default
//! - authenticated: everything else; `Authorization: Bearer <jwt>`, the
//!   tenant comes from the token
//! - relay hook: `/api/relay/inbound`, shared secret from the mail transport
//! - operator: `/api/admin/*`, operator token

pub mod accounts;
pub mod admin;
pub mod auth;
pub mod billing;
pub mod ciphers;
pub mod emergency;
pub mod folders;
pub mod health;
pub mod relay;
pub mod sync;
pub mod teams;

use std::sync::Arc;

use axum::Router;
use axum::middleware as axum_mw;

use crate::middleware::{admin_middleware, auth_middleware, relay_secret_middleware, tenant_middleware};
use crate::state::AppState;

/// Build the `/api` router with every group and its middleware applied.
pub fn api_router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    let tenant = || axum_mw::from_fn_with_state(Arc::clone(state), tenant_middleware);

    let public = Router::new()
        .merge(accounts::public_router())
        .merge(auth::router())
        .route_layer(tenant());

    // Later layers run first: the secret is checked before the tenant lookup.
    let relay_hook = relay::inbound_router()
        .route_layer(tenant())
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(state), relay_secret_middleware));

    let operator = admin::router()
        .route_layer(tenant())
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(state), admin_middleware));

    let authenticated = Router::new()
        .merge(accounts::router())
        .merge(sync::router())
        .merge(ciphers::router())
        .merge(folders::router())
        .merge(teams::router())
        .merge(emergency::router())
        .merge(billing::router())
        .merge(relay::router())
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(state), auth_middleware));

    let api = Router::new()
        .merge(health::router())
        .merge(public)
        .merge(relay_hook)
        .merge(operator)
        .merge(authenticated);

    Router::new().nest("/api", api)
}
