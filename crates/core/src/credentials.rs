//! Short-lived credentials for one call attempt.
//!
//! Two network calls are made per attempt: the relay (TURN/STUN) server list
//! and a realtime authorization token. The trial and authenticated variants
//! differ only in which routes they hit and what identity they present, so
//! both implementations share [`CredentialHttp`].

use crate::{
    config::DEFAULT_CREDENTIAL_TIMEOUT,
    error::{CallError, CredentialParseError},
    wire::{IceServer, RelayServersResponse, SessionContext},
};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Which of the accepted response layouts a token was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenShape {
    /// `{ "token": "..." }`, the only layout the current service emits.
    Canonical,
    /// `{ "client_secret": { "value": "..." } }`, the upstream session layout.
    ClientSecretObject,
    /// `{ "client_secret": "..." }`. Deprecated.
    ClientSecretString,
    /// `{ "ephemeralKey": "..." }` or `{ "ephemeral_key": "..." }`. Deprecated.
    EphemeralKey,
}

impl TokenShape {
    pub fn is_deprecated(self) -> bool {
        matches!(self, Self::ClientSecretString | Self::EphemeralKey)
    }
}

/// Probed strictly in this order; the first match wins.
const ACCEPTED_SHAPES: [TokenShape; 4] = [
    TokenShape::Canonical,
    TokenShape::ClientSecretObject,
    TokenShape::ClientSecretString,
    TokenShape::EphemeralKey,
];

const RAW_KEY_FIELDS: [&str; 4] = ["apiKey", "api_key", "openaiApiKey", "key"];
const RAW_KEY_PREFIX: &str = "sk-";

/// A bearer capability for the realtime endpoint.
#[derive(Clone)]
pub struct AuthToken {
    secret: SecretString,
    shape: TokenShape,
    expires_at: Option<i64>,
}

impl AuthToken {
    pub fn new(secret: impl Into<String>, shape: TokenShape, expires_at: Option<i64>) -> Self {
        Self {
            secret: SecretString::from(secret.into()),
            shape,
            expires_at,
        }
    }

    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn shape(&self) -> TokenShape {
        self.shape
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("shape", &self.shape)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Result of [`parse_credential_response`].
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub token: AuthToken,
    pub model: Option<String>,
}

/// Extracts the realtime token from a credential-service response.
///
/// Documents that carry what looks like a raw, long-lived API key are
/// rejected outright, even when a usable short-lived token is also present.
pub fn parse_credential_response(json: &Value) -> Result<ParsedToken, CredentialParseError> {
    let obj = json.as_object().ok_or(CredentialParseError::NotAnObject)?;

    if RAW_KEY_FIELDS.iter().any(|field| obj.contains_key(*field)) {
        warn!("Credential response contains a raw API key field; rejecting");
        return Err(CredentialParseError::RawSecretRejected);
    }

    let model = obj
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    for shape in ACCEPTED_SHAPES {
        let Some((secret, expires_at)) = probe_shape(obj, shape) else {
            continue;
        };
        if secret.starts_with(RAW_KEY_PREFIX) {
            warn!(?shape, "Credential response token looks like a raw API key; rejecting");
            return Err(CredentialParseError::RawSecretRejected);
        }
        if shape.is_deprecated() {
            warn!(?shape, "Credential response matched a deprecated token shape");
        } else {
            info!(?shape, "Credential response matched token shape");
        }
        return Ok(ParsedToken {
            token: AuthToken::new(secret, shape, expires_at),
            model,
        });
    }

    Err(CredentialParseError::NoAcceptedShape)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn probe_shape(
    obj: &serde_json::Map<String, Value>,
    shape: TokenShape,
) -> Option<(String, Option<i64>)> {
    match shape {
        TokenShape::Canonical => non_empty_str(obj.get("token")).map(|t| {
            let expires = obj.get("expiresAt").and_then(Value::as_i64);
            (t.to_string(), expires)
        }),
        TokenShape::ClientSecretObject => {
            let secret = obj.get("client_secret")?.as_object()?;
            non_empty_str(secret.get("value")).map(|t| {
                let expires = secret.get("expires_at").and_then(Value::as_i64);
                (t.to_string(), expires)
            })
        }
        TokenShape::ClientSecretString => {
            non_empty_str(obj.get("client_secret")).map(|t| (t.to_string(), None))
        }
        TokenShape::EphemeralKey => non_empty_str(obj.get("ephemeralKey"))
            .or_else(|| non_empty_str(obj.get("ephemeral_key")))
            .map(|t| (t.to_string(), None)),
    }
}

/// Everything the signaling step needs, fetched fresh for every attempt.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub relay_servers: Vec<IceServer>,
    pub auth_token: AuthToken,
    pub model: String,
}

/// Token plus the model it was minted for.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: AuthToken,
    pub model: Option<String>,
}

/// A source of per-attempt call credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn fetch_relay_servers(&self) -> Result<Vec<IceServer>, CallError>;
    async fn fetch_auth_token(&self, context: &SessionContext) -> Result<TokenGrant, CallError>;
}

/// Runs both credential calls. Either failing aborts the attempt.
pub async fn fetch_credentials(
    broker: &dyn CredentialBroker,
    context: &SessionContext,
    default_model: &str,
) -> Result<Credentials, CallError> {
    let relay_servers = broker.fetch_relay_servers().await?;
    let grant = broker.fetch_auth_token(context).await?;
    let model = grant.model.unwrap_or_else(|| default_model.to_string());
    info!(
        relay_servers = relay_servers.len(),
        relays = relay_servers.iter().filter(|s| s.is_relay()).count(),
        %model,
        "Call credentials fetched"
    );
    Ok(Credentials {
        relay_servers,
        auth_token: grant.token,
        model,
    })
}

/// Shared HTTP plumbing for both broker variants.
#[derive(Clone)]
struct CredentialHttp {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl CredentialHttp {
    fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: DEFAULT_CREDENTIAL_TIMEOUT,
        }
    }

    async fn relay_servers(
        &self,
        path: &str,
        identity: Option<&Identity>,
    ) -> Result<Vec<IceServer>, CallError> {
        let url = format!("{}{}", self.base_url, path);
        let request = apply_identity(self.client.get(&url).timeout(self.timeout), identity);
        let response = request.send().await.map_err(fetch_failed)?;
        let response = check_status(response).await?;
        let body: RelayServersResponse = response.json().await.map_err(fetch_failed)?;
        Ok(body.ice_servers)
    }

    async fn auth_token(
        &self,
        path: &str,
        identity: Option<&Identity>,
        context: &SessionContext,
    ) -> Result<TokenGrant, CallError> {
        let url = format!("{}{}", self.base_url, path);
        let request = apply_identity(
            self.client.post(&url).json(context).timeout(self.timeout),
            identity,
        );
        let response = request.send().await.map_err(fetch_failed)?;
        let response = check_status(response).await?;
        let body: Value = response.json().await.map_err(fetch_failed)?;
        let parsed = parse_credential_response(&body)?;
        Ok(TokenGrant {
            token: parsed.token,
            model: parsed.model,
        })
    }
}

fn fetch_failed(err: reqwest::Error) -> CallError {
    CallError::CredentialFetchFailed(err.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CallError::CredentialFetchFailed(format!(
        "credential service returned {}: {}",
        status, body
    )))
}

/// The caller identity presented on authenticated routes.
#[derive(Clone)]
struct Identity {
    bearer: SecretString,
    user_id: String,
}

fn apply_identity(
    request: reqwest::RequestBuilder,
    identity: Option<&Identity>,
) -> reqwest::RequestBuilder {
    match identity {
        Some(identity) => request
            .bearer_auth(identity.bearer.expose_secret())
            .header("x-user-id", &identity.user_id),
        None => request,
    }
}

/// Credentials for unauthenticated trial calls.
pub struct TrialCredentialBroker {
    http: CredentialHttp,
}

impl TrialCredentialBroker {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            http: CredentialHttp::new(client, base_url),
        }
    }

    /// Limit for each credential request. Defaults to ten seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http.timeout = timeout;
        self
    }
}

#[async_trait]
impl CredentialBroker for TrialCredentialBroker {
    async fn fetch_relay_servers(&self) -> Result<Vec<IceServer>, CallError> {
        self.http.relay_servers("/turn-credentials", None).await
    }

    async fn fetch_auth_token(&self, context: &SessionContext) -> Result<TokenGrant, CallError> {
        self.http
            .auth_token("/realtime-token/trial", None, context)
            .await
    }
}

/// Credentials for signed-in callers, using the session bearer from the
/// auth service.
pub struct AuthenticatedCredentialBroker {
    http: CredentialHttp,
    identity: Identity,
}

impl AuthenticatedCredentialBroker {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        bearer: SecretString,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            http: CredentialHttp::new(client, base_url),
            identity: Identity {
                bearer,
                user_id: user_id.into(),
            },
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http.timeout = timeout;
        self
    }
}

#[async_trait]
impl CredentialBroker for AuthenticatedCredentialBroker {
    async fn fetch_relay_servers(&self) -> Result<Vec<IceServer>, CallError> {
        self.http
            .relay_servers("/api/turn-credentials", Some(&self.identity))
            .await
    }

    async fn fetch_auth_token(&self, context: &SessionContext) -> Result<TokenGrant, CallError> {
        self.http
            .auth_token("/api/realtime-token", Some(&self.identity), context)
            .await
    }
}
