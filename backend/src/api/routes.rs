//! Route definitions for the API.

use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, middleware, routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::SharedState;
use crate::services::metrics_service::metrics_middleware;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    // Build OpenAPI spec once at startup
    let openapi = Arc::new(super::openapi::build_openapi());

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics))
        .route(
            "/api/v1/openapi.json",
            get(move || {
                let openapi = openapi.clone();
                async move { Json(openapi.as_ref().clone()) }
            }),
        )
        .nest("/api/v1", api_v1_routes())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API v1 routes
fn api_v1_routes() -> Router<SharedState> {
    Router::new()
        .nest("/schedules", handlers::schedules::router())
        .nest("/backups", handlers::backups::router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::test_support::{json_body, send, TestApp};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_routes_mounted_under_api_v1() {
        let app = TestApp::new();
        app.add_server(5, "gamma");
        let router = create_router(app.state.clone());

        let response = send(
            &router,
            "POST",
            "/api/v1/schedules",
            Some(json!({
                "server_id": 5,
                "schedule_type": "daily",
                "schedule_time": "04:00",
                "retention_days": 5
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = send(&router, "GET", "/api/v1/schedules/5", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&router, "GET", "/api/v1/backups/5/history", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);
    }

    #[tokio::test]
    async fn test_openapi_json_served() {
        let app = TestApp::new();
        let router = create_router(app.state.clone());

        let response = send(&router, "GET", "/api/v1/openapi.json", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["info"]["title"], "Backup Keeper API");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = TestApp::new();
        let router = create_router(app.state.clone());
        let response = send(&router, "GET", "/api/v1/nope", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_json_rejected() {
        let app = TestApp::new();
        let router = create_router(app.state.clone());
        let response = send(
            &router,
            "POST",
            "/api/v1/schedules",
            Some(json!({"server_id": "not-a-number"})),
        )
        .await;
        assert!(response.status().is_client_error());
    }
}
