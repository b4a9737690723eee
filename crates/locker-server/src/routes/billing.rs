//! Billing routes for the caller's own plan (`/billing/*`) and for a team's
//! plan (`/teams/{team_id}/billing/*`, owners and admins).

use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use uuid::Uuid;

use locker_core::billing::{Payment, Quote, Subscriber, Subscription, UpgradeRequest};
use locker_core::event::{ActivityEvent, EventKind};
use locker_core::permission::TeamAction;

use crate::error::AppError;
use crate::middleware::AuthContext;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PaymentListResponse {
    pub payments: Vec<Payment>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/billing/subscription", get(own_subscription))
        .route("/billing/quote", post(own_quote))
        .route("/billing/upgrade", post(own_upgrade))
        .route("/billing/cancel", post(own_cancel))
        .route("/billing/reactivate", post(own_reactivate))
        .route("/billing/payments", get(own_payments))
        .route("/teams/{team_id}/billing/subscription", get(team_subscription))
        .route("/teams/{team_id}/billing/quote", post(team_quote))
        .route("/teams/{team_id}/billing/upgrade", post(team_upgrade))
        .route("/teams/{team_id}/billing/cancel", post(team_cancel))
        .route("/teams/{team_id}/billing/reactivate", post(team_reactivate))
        .route("/teams/{team_id}/billing/payments", get(team_payments))
}

async fn team_subscriber(auth: &AuthContext, team_id: Uuid) -> Result<Subscriber, AppError> {
    auth.locker
        .teams
        .authorize(team_id, auth.user.id, TeamAction::ManageBilling)
        .await?;
    Ok(Subscriber::Team(team_id))
}

async fn subscription(auth: &AuthContext, subscriber: Subscriber) -> Result<Json<Subscription>, AppError> {
    Ok(Json(auth.locker.billing.subscription(subscriber).await?))
}

async fn quote(auth: &AuthContext, subscriber: Subscriber, request: &UpgradeRequest) -> Result<Json<Quote>, AppError> {
    Ok(Json(auth.locker.billing.quote(subscriber, request).await?))
}

async fn upgrade(
    auth: &AuthContext,
    subscriber: Subscriber,
    request: UpgradeRequest,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    let payment = auth.locker.purchase_plan(auth.user.id, subscriber, request).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

async fn cancel(auth: &AuthContext, subscriber: Subscriber) -> Result<Json<Subscription>, AppError> {
    let subscription = auth.locker.billing.cancel(subscriber).await?;
    auth.record(with_team(auth.event(EventKind::SubscriptionCanceled), subscriber))
        .await;
    Ok(Json(subscription))
}

async fn reactivate(auth: &AuthContext, subscriber: Subscriber) -> Result<Json<Subscription>, AppError> {
    let subscription = auth.locker.billing.reactivate(subscriber).await?;
    auth.record(with_team(auth.event(EventKind::SubscriptionReactivated), subscriber))
        .await;
    Ok(Json(subscription))
}

async fn payments(auth: &AuthContext, subscriber: Subscriber) -> Result<Json<PaymentListResponse>, AppError> {
    let payments = auth.locker.billing.payments(subscriber).await?;
    Ok(Json(PaymentListResponse { payments }))
}

fn with_team(event: ActivityEvent, subscriber: Subscriber) -> ActivityEvent {
    match subscriber {
        Subscriber::Team(team_id) => event.team(team_id),
        Subscriber::User(_) => event,
    }
}

// ── Caller's plan ────────────────────────────────────────────────────

/// `GET /api/billing/subscription`
async fn own_subscription(Extension(auth): Extension<AuthContext>) -> Result<Json<Subscription>, AppError> {
    subscription(&auth, Subscriber::User(auth.user.id)).await
}

/// `POST /api/billing/quote`: price a plan change without buying.
async fn own_quote(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<UpgradeRequest>,
) -> Result<Json<Quote>, AppError> {
    quote(&auth, Subscriber::User(auth.user.id), &body).await
}

/// `POST /api/billing/upgrade`
async fn own_upgrade(
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<UpgradeRequest>,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    upgrade(&auth, Subscriber::User(auth.user.id), body).await
}

/// `POST /api/billing/cancel`: stop at the end of the paid period.
async fn own_cancel(Extension(auth): Extension<AuthContext>) -> Result<Json<Subscription>, AppError> {
    cancel(&auth, Subscriber::User(auth.user.id)).await
}

/// `POST /api/billing/reactivate`
async fn own_reactivate(Extension(auth): Extension<AuthContext>) -> Result<Json<Subscription>, AppError> {
    reactivate(&auth, Subscriber::User(auth.user.id)).await
}

/// `GET /api/billing/payments`
async fn own_payments(Extension(auth): Extension<AuthContext>) -> Result<Json<PaymentListResponse>, AppError> {
    payments(&auth, Subscriber::User(auth.user.id)).await
}

// ── Team plan ────────────────────────────────────────────────────────

/// `GET /api/teams/{team_id}/billing/subscription`
async fn team_subscription(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    let subscriber = team_subscriber(&auth, team_id).await?;
    subscription(&auth, subscriber).await
}

/// `POST /api/teams/{team_id}/billing/quote`
async fn team_quote(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
    Json(body): Json<UpgradeRequest>,
) -> Result<Json<Quote>, AppError> {
    let subscriber = team_subscriber(&auth, team_id).await?;
    quote(&auth, subscriber, &body).await
}

/// `POST /api/teams/{team_id}/billing/upgrade`
async fn team_upgrade(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
    Json(body): Json<UpgradeRequest>,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    let subscriber = team_subscriber(&auth, team_id).await?;
    upgrade(&auth, subscriber, body).await
}

/// `POST /api/teams/{team_id}/billing/cancel`
async fn team_cancel(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    let subscriber = team_subscriber(&auth, team_id).await?;
    cancel(&auth, subscriber).await
}

/// `POST /api/teams/{team_id}/billing/reactivate`
async fn team_reactivate(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    let subscriber = team_subscriber(&auth, team_id).await?;
    reactivate(&auth, subscriber).await
}

/// `GET /api/teams/{team_id}/billing/payments`
async fn team_payments(
    Extension(auth): Extension<AuthContext>,
    Path(team_id): Path<Uuid>,
) -> Result<Json<PaymentListResponse>, AppError> {
    let subscriber = team_subscriber(&auth, team_id).await?;
    payments(&auth, subscriber).await
}
