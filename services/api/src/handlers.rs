//! Axum Handlers for the credential routes
//!
//! Trial routes are open; the `/api` routes require the `x-user-id` header
//! set by the authenticating gateway. It uses `utoipa` doc comments to
//! generate OpenAPI documentation.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use parley_core::EntitlementTier;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    minter::MintRequest,
    models::{
        ErrorResponse, IceServerEntry, RealtimeTokenRequest, RealtimeTokenResponse,
        TurnCredentialsResponse,
    },
    state::AppState,
};

const INTERVIEWER_PROMPT: &str = "You are a case interviewer for a consulting firm. \
Speak naturally and concisely, ask one question at a time, and probe the candidate's \
structure, math and synthesis. Do not solve the case for them.";

pub enum ApiError {
    BadRequest(String),
    BadGateway(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::BadGateway(message) => {
                (StatusCode::BAD_GATEWAY, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn user_id(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest("x-user-id header is required".to_string()))
}

/// Groups the configured URLs into one direct (STUN) entry and one relay
/// (TURN) entry carrying the relay credentials.
pub fn ice_servers(config: &Config) -> Vec<IceServerEntry> {
    let (relay, direct): (Vec<String>, Vec<String>) = config
        .ice_server_urls
        .iter()
        .cloned()
        .partition(|u| u.starts_with("turn:") || u.starts_with("turns:"));

    let mut servers = Vec::new();
    if !direct.is_empty() {
        servers.push(IceServerEntry {
            urls: direct,
            username: None,
            credential: None,
        });
    }
    if !relay.is_empty() {
        servers.push(IceServerEntry {
            urls: relay,
            username: config.turn_username.clone(),
            credential: config
                .turn_credential
                .as_ref()
                .map(|c| c.expose_secret().to_string()),
        });
    }
    servers
}

/// Session instructions for the interviewer voice.
pub fn build_instructions(request: &RealtimeTokenRequest, tier: EntitlementTier) -> String {
    let mut instructions = INTERVIEWER_PROMPT.to_string();
    if let Some(case_id) = &request.case_id {
        instructions.push_str(&format!("\n\nCase: {}", case_id));
    }
    if let Some(question) = &request.question {
        instructions.push_str(&format!("\nOpen the interview with: {}", question));
    }
    if tier == EntitlementTier::Trial {
        instructions.push_str("\n\nThis is a one-minute trial. Keep every turn short.");
    }
    instructions
}

async fn mint_token(
    state: &AppState,
    request: &RealtimeTokenRequest,
    tier: EntitlementTier,
) -> Result<Json<RealtimeTokenResponse>, ApiError> {
    let mint = MintRequest {
        model: state.config.realtime_model.clone(),
        voice: state.config.realtime_voice.clone(),
        instructions: build_instructions(request, tier),
    };
    let minted = state.minter.mint(&mint).await.map_err(|e| {
        warn!(error = %e, ?tier, "Realtime token minting failed");
        ApiError::BadGateway("Could not mint a realtime token".to_string())
    })?;

    info!(?tier, case_id = ?request.case_id, model = %minted.model, "Realtime token issued");
    Ok(Json(RealtimeTokenResponse {
        token: minted.secret.expose_secret().to_string(),
        model: minted.model,
        expires_at: minted.expires_at,
    }))
}

/// Relay servers for a trial call.
#[utoipa::path(
    get,
    path = "/turn-credentials",
    responses(
        (status = 200, description = "STUN/TURN servers", body = TurnCredentialsResponse)
    )
)]
pub async fn trial_turn_credentials(
    State(state): State<Arc<AppState>>,
) -> Json<TurnCredentialsResponse> {
    Json(TurnCredentialsResponse {
        ice_servers: ice_servers(&state.config),
    })
}

/// A short-lived realtime token for a trial call.
#[utoipa::path(
    post,
    path = "/realtime-token/trial",
    request_body = RealtimeTokenRequest,
    responses(
        (status = 200, description = "Token minted", body = RealtimeTokenResponse),
        (status = 502, description = "Token provider unavailable", body = ErrorResponse)
    )
)]
pub async fn trial_realtime_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RealtimeTokenRequest>,
) -> Result<Json<RealtimeTokenResponse>, ApiError> {
    mint_token(&state, &request, EntitlementTier::Trial).await
}

/// Relay servers for a signed-in caller.
#[utoipa::path(
    get,
    path = "/api/turn-credentials",
    responses(
        (status = 200, description = "STUN/TURN servers", body = TurnCredentialsResponse),
        (status = 400, description = "Missing caller identity", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the calling user")
    )
)]
pub async fn turn_credentials(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<TurnCredentialsResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    info!(%user_id, "Relay servers requested");
    Ok(Json(TurnCredentialsResponse {
        ice_servers: ice_servers(&state.config),
    }))
}

/// A short-lived realtime token for a signed-in caller.
#[utoipa::path(
    post,
    path = "/api/realtime-token",
    request_body = RealtimeTokenRequest,
    responses(
        (status = 200, description = "Token minted", body = RealtimeTokenResponse),
        (status = 400, description = "Missing caller identity", body = ErrorResponse),
        (status = 502, description = "Token provider unavailable", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the calling user")
    )
)]
pub async fn realtime_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RealtimeTokenRequest>,
) -> Result<Json<RealtimeTokenResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    info!(%user_id, "Realtime token requested");
    mint_token(&state, &request, EntitlementTier::Authenticated).await
}
