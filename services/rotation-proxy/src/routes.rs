//! HTTP surface
//!
//! Three rotation-enabled POST routes, the status and health read-only
//! endpoints, Prometheus exposition, and a passthrough fallback for every
//! other path.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use claude_pool::PoolStatus;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::rotation::{AppState, ROTATION_ENABLED_PATHS, passthrough_handler, rotation_handler};

pub fn build_router(state: AppState, metrics_handle: PrometheusHandle) -> Router {
    let mut router = Router::new();
    for path in ROTATION_ENABLED_PATHS {
        router = router.route(path, post(rotation_handler));
    }
    router
        .route("/rotation/status", get(rotation_status))
        .route("/health", get(health))
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
        .fallback(passthrough_handler)
        .with_state(state)
}

/// GET /health — liveness, no auth.
async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// GET /rotation/status — pool snapshot.
async fn rotation_status(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.pool.status().await)
}
