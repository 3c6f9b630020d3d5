pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

pub use middleware::require_actor;
pub use ws_handler::ws_handler;

use axum::{
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderName, HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{delete, get, post, put},
    Router,
};
use rest::*;
use state::AppState;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

fn cors_layer(frontend_url: Option<&str>) -> CorsLayer {
    let origin = match frontend_url.map(HeaderValue::from_str) {
        Some(Ok(origin)) => AllowOrigin::exact(origin),
        Some(Err(_)) => {
            warn!("FRONTEND_URL is not a valid origin; allowing any origin");
            AllowOrigin::any()
        }
        None => AllowOrigin::any(),
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            HeaderName::from_static(middleware::USER_ID_HEADER),
            HeaderName::from_static(middleware::USER_ROLE_HEADER),
        ])
}

/// Builds the complete application: REST routes, the live channel and Swagger UI.
pub fn build_router(app_state: Arc<AppState>) -> Router {
    // Public routes (no identity required)
    let public_routes = Router::new().route("/health", get(health_handler));

    // Protected routes (identity required)
    let protected_routes = Router::new()
        .route("/journeys", post(create_journey_handler))
        .route("/journeys/emergency", post(emergency_handler))
        .route("/journeys/active", get(active_journeys_handler))
        .route("/journeys/history", get(journey_history_handler))
        .route("/journeys/current", get(current_journey_handler))
        .route("/journeys/{id}", get(get_journey_handler))
        .route("/journeys/{id}/start", post(start_journey_handler))
        .route("/journeys/{id}/location", post(journey_location_handler))
        .route("/journeys/{id}/complete", post(complete_journey_handler))
        .route("/journeys/{id}/checkpoints", post(checkpoint_handler))
        .route("/journeys/{id}/alerts", get(journey_alerts_handler))
        .route("/alerts/{id}/resolve", post(resolve_alert_handler))
        .route("/alerts/{id}/acknowledge", post(acknowledge_alert_handler))
        .route("/sos", post(send_sos_handler))
        .route("/sos/history", get(sos_history_handler))
        .route("/sos/{id}", get(get_sos_handler))
        .route("/location", post(location_handler))
        .route("/users/me", put(update_profile_handler))
        .route("/users/me/device-tokens", post(register_device_token_handler))
        .route("/users/{id}/location", get(user_location_handler))
        .route(
            "/connections/requests",
            post(request_connection_handler).get(pending_connections_handler),
        )
        .route("/connections/requests/{id}/respond", post(respond_connection_handler))
        .route("/connections/{id}", delete(disconnect_handler))
        .route("/ws", get(ws_handler))
        .layer(axum_middleware::from_fn(require_actor));

    let cors = cors_layer(app_state.config.frontend_url.as_deref());

    // Combine API routes
    let api_router = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
