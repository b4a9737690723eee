//! Request middleware: tenant selection, bearer authentication and the
//! shared-secret checks of the relay hook and operator endpoints.
//!
//! The resolved tenant is inserted into the request's extensions. Nothing
//! about the current request is kept in shared state.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use locker_core::Locker;
use locker_core::auth::AccessClaims;
use locker_core::crypto::constant_time_eq;
use locker_core::error::AccountError;
use locker_core::event::{ActivityEvent, EventKind};
use locker_core::user::User;

use crate::error::AppError;
use crate::state::AppState;

/// Header naming the tenant of an unauthenticated request.
pub const TENANT_HEADER: &str = "x-locker-tenant";
/// Header carrying the relay transport's shared secret.
pub const RELAY_SECRET_HEADER: &str = "x-locker-relay-secret";
/// Header carrying the operator token.
pub const ADMIN_TOKEN_HEADER: &str = "x-locker-admin-token";

/// The tenant a request is served by.
#[derive(Debug, Clone)]
pub struct Tenant(pub Arc<Locker>);

/// Authentication context injected into request extensions.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The caller, as loaded for this request.
    pub user: User,
    pub claims: AccessClaims,
    /// The caller's tenant, taken from the token.
    pub locker: Arc<Locker>,
}

impl AuthContext {
    /// An event attributed to the caller.
    #[must_use]
    pub fn event(&self, kind: EventKind) -> ActivityEvent {
        ActivityEvent::new(kind).actor(self.user.id)
    }

    pub async fn record(&self, event: ActivityEvent) {
        self.locker.events.record(event).await;
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Resolve the tenant from `X-Locker-Tenant`, falling back to the default.
///
/// # Errors
///
/// Returns `NotFound` for an unknown tenant, `BadRequest` for a malformed one.
pub async fn tenant_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let locker = state.tenants.resolve(header(req.headers(), TENANT_HEADER))?;
    req.extensions_mut().insert(Tenant(locker));
    Ok(next.run(req).await)
}

/// Validate `Authorization: Bearer <jwt>` and load the caller.
///
/// The token's `tenant` claim selects the tenant. A conflicting
/// `X-Locker-Tenant` header is refused.
///
/// # Errors
///
/// Returns `Unauthorized` if the header is missing, the token is invalid or
/// expired, or the security stamp has changed since it was issued.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = header(req.headers(), "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_owned()))?;

    let claims = state.jwt.verify(token)?;

    if let Some(hint) = header(req.headers(), TENANT_HEADER).map(str::trim) {
        if !hint.is_empty() && hint != claims.tenant {
            return Err(AppError::Unauthorized(
                "token was issued for another tenant".to_owned(),
            ));
        }
    }

    let locker = state.tenants.resolve(Some(&claims.tenant)).map_err(|e| {
        warn!(tenant = %claims.tenant, error = %e, "token names an unavailable tenant");
        AppError::Unauthorized("invalid token".to_owned())
    })?;
    let user = locker.auth.authenticate(&claims).await.map_err(|e| match e {
        AccountError::UserNotFound => AppError::Unauthorized("invalid token".to_owned()),
        other => other.into(),
    })?;

    req.extensions_mut().insert(Tenant(Arc::clone(&locker)));
    req.extensions_mut().insert(AuthContext { user, claims, locker });
    Ok(next.run(req).await)
}

fn check_secret(headers: &HeaderMap, name: &str, expected: Option<&str>) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Err(AppError::NotFound("endpoint disabled".to_owned()));
    };
    match header(headers, name) {
        Some(presented) if constant_time_eq(presented, expected) => Ok(()),
        _ => Err(AppError::Unauthorized(format!("missing or invalid {name} header"))),
    }
}

/// Require the relay transport's shared secret.
///
/// # Errors
///
/// Returns `NotFound` when no secret is configured and `Unauthorized` when
/// the header does not match.
pub async fn relay_secret_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    check_secret(req.headers(), RELAY_SECRET_HEADER, state.relay_secret.as_deref())?;
    Ok(next.run(req).await)
}

/// Require the operator token.
///
/// # Errors
///
/// Returns `NotFound` when no token is configured and `Unauthorized` when
/// the header does not match.
pub async fn admin_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    check_secret(req.headers(), ADMIN_TOKEN_HEADER, state.admin_token.as_deref())?;
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn shared_secret_checks() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            check_secret(&headers, RELAY_SECRET_HEADER, None),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            check_secret(&headers, RELAY_SECRET_HEADER, Some("s3cret")),
            Err(AppError::Unauthorized(_))
        ));
        headers.insert(RELAY_SECRET_HEADER, HeaderValue::from_static("wrong"));
        assert!(check_secret(&headers, RELAY_SECRET_HEADER, Some("s3cret")).is_err());
        headers.insert(RELAY_SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(check_secret(&headers, RELAY_SECRET_HEADER, Some("s3cret")).is_ok());
    }
}
