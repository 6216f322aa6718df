//! Request and response bodies, annotated for OpenAPI generation with `utoipa`.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One STUN/TURN entry in the browser `RTCIceServer` layout.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct IceServerEntry {
    #[schema(example = json!(["stun:stun.l.google.com:19302"]))]
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TurnCredentialsResponse {
    pub ice_servers: Vec<IceServerEntry>,
}

/// The interview case the token is minted for. Both fields are optional.
#[derive(Deserialize, ToSchema, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeTokenRequest {
    #[serde(default)]
    #[schema(example = "market-sizing-01")]
    pub case_id: Option<String>,
    #[serde(default)]
    #[schema(example = "How many piano tuners are there in Chicago?")]
    pub question: Option<String>,
}

/// A short-lived realtime token. Never a long-lived API key.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeTokenResponse {
    #[schema(example = "ek_68af...")]
    pub token: String,
    #[schema(example = "gpt-realtime")]
    pub model: String,
    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
