//! Operator endpoints, per tenant: settle bank-transfer payments, manage
//! promo codes and trigger a maintenance pass.

use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use locker_core::billing::{Payment, PromoCode, Subscription};
use locker_core::jobs::JobReport;

use crate::error::AppError;
use crate::middleware::Tenant;
use crate::routes::billing::PaymentListResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RejectPaymentRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct JobRunResponse {
    pub tenant: String,
    pub jobs: Vec<JobReport>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/payments/pending", get(pending_payments))
        .route("/admin/payments/{payment_id}/confirm", post(confirm_payment))
        .route("/admin/payments/{payment_id}/reject", post(reject_payment))
        .route("/admin/promos", post(create_promo))
        .route("/admin/jobs/run", post(run_jobs))
}

/// `GET /api/admin/payments/pending`
async fn pending_payments(Extension(Tenant(locker)): Extension<Tenant>) -> Result<Json<PaymentListResponse>, AppError> {
    let payments = locker.billing.pending_payments().await?;
    Ok(Json(PaymentListResponse { payments }))
}

/// `POST /api/admin/payments/{payment_id}/confirm`: the money arrived.
async fn confirm_payment(
    Extension(Tenant(locker)): Extension<Tenant>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    Ok(Json(locker.confirm_payment(payment_id).await?))
}

/// `POST /api/admin/payments/{payment_id}/reject`
async fn reject_payment(
    Extension(Tenant(locker)): Extension<Tenant>,
    Path(payment_id): Path<Uuid>,
    Json(body): Json<RejectPaymentRequest>,
) -> Result<Json<Payment>, AppError> {
    if body.reason.trim().is_empty() {
        return Err(AppError::BadRequest("reason must not be empty".to_owned()));
    }
    Ok(Json(locker.reject_payment(payment_id, body.reason.trim()).await?))
}

/// `POST /api/admin/promos`: create or replace a promo code.
async fn create_promo(
    Extension(Tenant(locker)): Extension<Tenant>,
    Json(body): Json<PromoCode>,
) -> Result<(StatusCode, Json<PromoCode>), AppError> {
    let promo = locker.billing.create_promo(body).await?;
    info!(tenant = locker.alias(), code = %promo.code, "promo code saved");
    Ok((StatusCode::CREATED, Json(promo)))
}

/// `POST /api/admin/jobs/run`: one maintenance pass over this tenant.
async fn run_jobs(Extension(Tenant(locker)): Extension<Tenant>) -> Json<JobRunResponse> {
    let jobs = locker.scheduler().run_all(Utc::now()).await;
    Json(JobRunResponse {
        tenant: locker.alias().to_owned(),
        jobs,
    })
}
