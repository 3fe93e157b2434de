use axum::{extract::State, http::{Method, StatusCode}, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{database, AppState};

pub mod workflows;

pub use workflows::workflow_routes;

/// Full HTTP surface of the service
pub fn api_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "SalonFlow Workflow API v1" }))
        .route("/health", get(health_check))
        .nest("/api/v1/shops/:shop_id", workflow_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    if database::health_check(&state.db_pool).await {
        (StatusCode::OK, Json(json!({"status": "healthy", "service": "salonflow-api"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "service": "salonflow-api", "database": "unreachable"})),
        )
    }
}
