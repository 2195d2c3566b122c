//! Route configuration.

use axum::middleware::from_fn_with_state;
use axum::routing::{Router, get, post};
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, list_users, login, protection_stats, report, webhook};
use crate::middleware::{ProtectionState, protect};

/// Create the demo router with the admission layer applied to every route.
///
/// `stats_path`, when set, serves the protection statistics as JSON. It sits
/// behind the admission layer like everything else.
pub fn create_router(state: ProtectionState, stats_path: Option<&str>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/api/users", get(list_users))
        .route("/api/auth/login", post(login))
        .route("/api/reports/{name}", get(report))
        .route("/api/webhooks/{provider}", post(webhook));

    if let Some(path) = stats_path {
        router = router.route(path, get(protection_stats));
    }

    router
        .layer(from_fn_with_state(state.clone(), protect))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
