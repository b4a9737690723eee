//! HTTP error types for the Locker server.
//!
//! Maps domain errors from `locker-core` into HTTP responses. Every variant
//! produces a JSON body with a machine-readable `error` field and a
//! human-readable `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use locker_core::error::{
    AccountError, BarrierError, BillingError, EmergencyError, EventError, LockerError, RelayError,
    TeamError, TenantError, VaultError,
};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Missing or invalid credentials.
    Unauthorized(String),
    /// Authenticated, but not allowed.
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    /// State conflict (duplicate, wrong status, last owner).
    Conflict(String),
    /// The subscriber's plan does not include the feature or capacity.
    PaymentRequired(String),
    /// Account temporarily locked after failed logins.
    Locked(String),
    /// The payment provider failed.
    BadGateway(String),
    /// Internal server error. The message is logged, never returned.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::PaymentRequired(msg) => (StatusCode::PAYMENT_REQUIRED, "payment_required", msg),
            Self::Locked(msg) => (StatusCode::LOCKED, "locked", msg),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "bad_gateway", msg),
            Self::Internal(msg) => {
                error!(error = %msg, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<BarrierError> for AppError {
    fn from(err: BarrierError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<TenantError> for AppError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::Unknown { .. } => Self::NotFound(err.to_string()),
            TenantError::InvalidAlias { .. } => Self::BadRequest(err.to_string()),
            TenantError::Duplicate { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl From<AccountError> for AppError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::InvalidCredentials
            | AccountError::InvalidToken { .. }
            | AccountError::TokenExpired => Self::Unauthorized(err.to_string()),
            AccountError::Locked { .. } => Self::Locked(err.to_string()),
            AccountError::UserNotFound => Self::NotFound(err.to_string()),
            AccountError::EmailTaken | AccountError::SoleOwner { .. } => Self::Conflict(err.to_string()),
            AccountError::InvalidInput { .. } => Self::BadRequest(err.to_string()),
            AccountError::Signing { .. } | AccountError::Crypto(_) | AccountError::Barrier(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound { .. } => Self::NotFound(err.to_string()),
            VaultError::Forbidden { .. } => Self::Forbidden(err.to_string()),
            VaultError::InvalidInput { .. } => Self::BadRequest(err.to_string()),
            VaultError::Barrier(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<TeamError> for AppError {
    fn from(err: TeamError) -> Self {
        match err {
            TeamError::NotFound { .. } => Self::NotFound(err.to_string()),
            TeamError::Forbidden { .. } => Self::Forbidden(err.to_string()),
            TeamError::InvalidInput { .. } => Self::BadRequest(err.to_string()),
            TeamError::Conflict { .. } => Self::Conflict(err.to_string()),
            TeamError::SeatLimit { .. } => Self::PaymentRequired(err.to_string()),
            TeamError::Barrier(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<EmergencyError> for AppError {
    fn from(err: EmergencyError) -> Self {
        match err {
            EmergencyError::NotFound { .. } => Self::NotFound(err.to_string()),
            EmergencyError::Forbidden { .. } => Self::Forbidden(err.to_string()),
            EmergencyError::InvalidTransition { .. } | EmergencyError::Duplicate => {
                Self::Conflict(err.to_string())
            }
            EmergencyError::InvalidInput { .. } => Self::BadRequest(err.to_string()),
            EmergencyError::NotEntitled => Self::PaymentRequired(err.to_string()),
            EmergencyError::Crypto(_) | EmergencyError::Barrier(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound { .. } => Self::NotFound(err.to_string()),
            BillingError::InvalidInput { .. } | BillingError::InvalidPromo { .. } => {
                Self::BadRequest(err.to_string())
            }
            BillingError::PaymentDeclined { .. } => Self::PaymentRequired(err.to_string()),
            BillingError::Gateway { .. } => Self::BadGateway(err.to_string()),
            BillingError::Conflict { .. } => Self::Conflict(err.to_string()),
            BillingError::Barrier(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NotFound { .. } => Self::NotFound(err.to_string()),
            RelayError::LimitReached { .. } | RelayError::NotEntitled => {
                Self::PaymentRequired(err.to_string())
            }
            RelayError::InvalidInput { .. } => Self::BadRequest(err.to_string()),
            RelayError::AddressTaken => Self::Conflict(err.to_string()),
            RelayError::Barrier(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<EventError> for AppError {
    fn from(err: EventError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<LockerError> for AppError {
    fn from(err: LockerError) -> Self {
        match err {
            LockerError::Account(e) => e.into(),
            LockerError::Vault(e) => e.into(),
            LockerError::Team(e) => e.into(),
            LockerError::Emergency(e) => e.into(),
            LockerError::Billing(e) => e.into(),
            LockerError::Relay(e) => e.into(),
            LockerError::Event(e) => e.into(),
            LockerError::Barrier(e) => e.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use locker_storage::StorageError;
    use uuid::Uuid;

    use super::*;

    fn status(err: impl Into<AppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn domain_errors_map_to_status_codes() {
        assert_eq!(status(AccountError::InvalidCredentials), StatusCode::UNAUTHORIZED);
        assert_eq!(status(AccountError::Locked { until: chrono::Utc::now() }), StatusCode::LOCKED);
        assert_eq!(status(AccountError::SoleOwner { team_id: Uuid::nil() }), StatusCode::CONFLICT);
        assert_eq!(
            status(VaultError::NotFound { kind: "cipher", id: Uuid::nil() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status(TeamError::SeatLimit { seats: 2, in_use: 2 }), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(status(EmergencyError::Duplicate), StatusCode::CONFLICT);
        assert_eq!(status(RelayError::LimitReached { limit: 5 }), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            status(BillingError::Gateway { reason: "timeout".to_owned() }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(TenantError::Unknown { alias: "eu".to_owned() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status(LockerError::Relay(RelayError::AddressTaken)), StatusCode::CONFLICT);
    }

    async fn body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn internal_message_is_hidden() {
        let response = AppError::Internal("postgres: connection refused".to_owned()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body(response).await;
        assert_eq!(body["error"], "internal_error");
        assert_eq!(body["message"], "internal server error");
        assert!(!body.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn storage_failures_in_emergency_and_relay_are_internal() {
        let storage = || {
            BarrierError::Storage(StorageError::Read {
                key: "user-ciphers/x".to_owned(),
                reason: "connection reset by peer".to_owned(),
            })
        };
        for err in [
            AppError::from(EmergencyError::Barrier(storage())),
            AppError::from(RelayError::Barrier(storage())),
        ] {
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert!(!body(response).await.to_string().contains("user-ciphers"));
        }
    }
}
