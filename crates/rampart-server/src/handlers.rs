//! Request handlers.
//!
//! The API handlers are placeholders standing in for an application behind
//! the admission layer; each route exercises a different endpoint tier.

use axum::Json;
use axum::extract::{Path, State};
use rampart_ddos::DdosStats;
use serde::Serialize;

use crate::middleware::ProtectionState;

/// Response for GET /health.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status message.
    pub status: &'static str,
}

/// Generic acknowledgement body.
#[derive(Debug, Serialize)]
pub struct Ack {
    /// Which endpoint answered.
    pub endpoint: String,
}

/// Handle GET /health.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Handle GET /api/users.
pub async fn list_users() -> Json<Ack> {
    Json(Ack {
        endpoint: "users".to_string(),
    })
}

/// Handle POST /api/auth/login.
pub async fn login() -> Json<Ack> {
    Json(Ack {
        endpoint: "login".to_string(),
    })
}

/// Handle GET /api/reports/{name}.
pub async fn report(Path(name): Path<String>) -> Json<Ack> {
    Json(Ack {
        endpoint: format!("report:{name}"),
    })
}

/// Handle POST /api/webhooks/{provider}.
pub async fn webhook(Path(provider): Path<String>) -> Json<Ack> {
    Json(Ack {
        endpoint: format!("webhook:{provider}"),
    })
}

/// Handle GET on the configured stats path.
pub async fn protection_stats(State(state): State<ProtectionState>) -> Json<DdosStats> {
    Json(state.protection.stats())
}
