//! Liveness endpoint.

use axum::Json;
use serde::Serialize;

use crate::VESTRI_VERSION;

#[derive(Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        version: VESTRI_VERSION,
    })
}
