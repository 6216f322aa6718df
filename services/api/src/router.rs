//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the credential routes and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ErrorResponse, IceServerEntry, RealtimeTokenRequest, RealtimeTokenResponse,
        TurnCredentialsResponse,
    },
    state::AppState,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::trial_turn_credentials,
        handlers::trial_realtime_token,
        handlers::turn_credentials,
        handlers::realtime_token,
    ),
    components(
        schemas(IceServerEntry, TurnCredentialsResponse, RealtimeTokenRequest, RealtimeTokenResponse, ErrorResponse)
    ),
    tags(
        (name = "Parley API", description = "Short-lived call credentials for interview sessions")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/turn-credentials", get(handlers::trial_turn_credentials))
        .route(
            "/realtime-token/trial",
            post(handlers::trial_realtime_token),
        )
        .route("/api/turn-credentials", get(handlers::turn_credentials))
        .route("/api/realtime-token", post(handlers::realtime_token))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
