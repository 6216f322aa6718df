use parley_core::config::DEFAULT_REALTIME_MODEL;
use secrecy::SecretString;
use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which backend mints realtime tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MinterKind {
    OpenAI,
    Mock,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub minter: MinterKind,
    pub openai_api_key: Option<SecretString>,
    pub openai_api_base: String,
    pub realtime_model: String,
    pub realtime_voice: String,
    pub ice_server_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<SecretString>,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let minter_str = std::env::var("TOKEN_MINTER").unwrap_or_else(|_| "openai".to_string());
        let minter = match minter_str.to_lowercase().as_str() {
            "mock" => MinterKind::Mock,
            "openai" => MinterKind::OpenAI,
            other => {
                return Err(ConfigError::InvalidValue(
                    "TOKEN_MINTER".to_string(),
                    format!("'{}' is not one of openai, mock", other),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok().map(SecretString::from);
        let openai_api_base = std::env::var("OPENAI_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        let realtime_model =
            std::env::var("REALTIME_MODEL").unwrap_or_else(|_| DEFAULT_REALTIME_MODEL.to_string());
        let realtime_voice =
            std::env::var("REALTIME_VOICE").unwrap_or_else(|_| "alloy".to_string());

        let ice_server_urls: Vec<String> = std::env::var("ICE_SERVER_URLS")
            .unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_string())
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();
        if let Some(bad) = ice_server_urls
            .iter()
            .find(|u| !["stun:", "turn:", "turns:"].iter().any(|p| u.starts_with(p)))
        {
            return Err(ConfigError::InvalidValue(
                "ICE_SERVER_URLS".to_string(),
                format!("'{}' is not a stun:, turn: or turns: URL", bad),
            ));
        }

        let turn_username = std::env::var("TURN_USERNAME").ok();
        let turn_credential = std::env::var("TURN_CREDENTIAL").ok().map(SecretString::from);
        let has_relay = ice_server_urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"));
        if has_relay && (turn_username.is_none() || turn_credential.is_none()) {
            return Err(ConfigError::MissingVar(
                "TURN_USERNAME and TURN_CREDENTIAL must be set when ICE_SERVER_URLS lists a TURN server"
                    .to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        if minter == MinterKind::OpenAI && openai_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "OPENAI_API_KEY must be set for the 'openai' token minter".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            minter,
            openai_api_key,
            openai_api_base,
            realtime_model,
            realtime_voice,
            ice_server_urls,
            turn_username,
            turn_credential,
            log_level,
        })
    }
}
