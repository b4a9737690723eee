//! Liveness probe.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub tenants: usize,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

/// `GET /api/health`
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        tenants: state.tenants.len(),
    })
}
