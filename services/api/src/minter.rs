//! Realtime token minting.
//!
//! The long-lived provider key stays inside this service; callers only ever
//! receive the short-lived client secret of a freshly created session.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Parameters of the realtime session a token is minted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MintRequest {
    pub model: String,
    pub voice: String,
    pub instructions: String,
}

#[derive(Debug, Clone)]
pub struct MintedToken {
    pub secret: SecretString,
    pub model: String,
    pub expires_at: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum MintError {
    #[error("Token provider returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("Token provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Token provider response carried no client secret")]
    MissingSecret,
}

#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint(&self, request: &MintRequest) -> Result<MintedToken, MintError>;
}

#[derive(Deserialize)]
struct UpstreamSession {
    model: Option<String>,
    client_secret: Option<UpstreamSecret>,
}

#[derive(Deserialize)]
struct UpstreamSecret {
    value: String,
    expires_at: Option<i64>,
}

/// Creates realtime sessions at `<api_base>/realtime/sessions`.
pub struct OpenAiTokenMinter {
    client: reqwest::Client,
    api_base: String,
    api_key: SecretString,
}

impl OpenAiTokenMinter {
    pub fn new(client: reqwest::Client, api_base: &str, api_key: SecretString) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl TokenMinter for OpenAiTokenMinter {
    async fn mint(&self, request: &MintRequest) -> Result<MintedToken, MintError> {
        let url = format!("{}/realtime/sessions", self.api_base);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Token provider rejected session request");
            return Err(MintError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let session: UpstreamSession = response.json().await?;
        let secret = session
            .client_secret
            .filter(|s| !s.value.is_empty())
            .ok_or(MintError::MissingSecret)?;
        let model = session.model.unwrap_or_else(|| request.model.clone());
        info!(%model, expires_at = ?secret.expires_at, "Realtime token minted");

        Ok(MintedToken {
            secret: SecretString::from(secret.value),
            model,
            expires_at: secret.expires_at,
        })
    }
}

/// A mock `TokenMinter` for development and integration testing.
///
/// Mints a unique, obviously fake `ek_mock_` token valid for one minute and
/// records nothing upstream.
pub struct MockTokenMinter;

#[async_trait]
impl TokenMinter for MockTokenMinter {
    async fn mint(&self, request: &MintRequest) -> Result<MintedToken, MintError> {
        Ok(MintedToken {
            secret: SecretString::from(format!("ek_mock_{}", uuid::Uuid::new_v4().simple())),
            model: request.model.clone(),
            expires_at: Some(chrono::Utc::now().timestamp() + 60),
        })
    }
}
