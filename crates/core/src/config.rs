use std::time::Duration;

use crate::signaling::ModelFallback;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

pub const DEFAULT_REALTIME_ENDPOINT: &str = "https://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-realtime";
pub const DEFAULT_ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TRIAL_LIMIT_SECS: u64 = 60;
pub const DEFAULT_AUTHENTICATED_LIMIT_SECS: u64 = 180;
pub const DEFAULT_METER_FFT_SIZE: usize = 256;
pub const DEFAULT_METER_FRAME: Duration = Duration::from_millis(16);

/// Delays at which the remote audio sink is (re)installed after a track arrives.
pub const DEFAULT_SINK_RETRY_SCHEDULE: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_millis(500),
    Duration::from_millis(1500),
    Duration::from_millis(3000),
];

/// Tunables for a call session, loaded once and shared by every attempt.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// Base URL of the credential service (relay servers and realtime tokens).
    pub credentials_base_url: String,
    pub realtime_endpoint: String,
    /// Used when the token response does not name a model.
    pub default_model: String,
    pub model_fallbacks: Vec<ModelFallback>,
    pub ice_gathering_timeout: Duration,
    pub negotiation_timeout: Duration,
    /// Per-request limit for each credential service call.
    pub credential_timeout: Duration,
    /// Target bitrate written into the offer's audio section, if any.
    pub audio_bitrate_kbps: Option<u32>,
    pub trial_limit_secs: Option<u64>,
    pub authenticated_limit_secs: Option<u64>,
    pub meter_fft_size: usize,
    pub meter_frame: Duration,
    pub sink_retry_schedule: Vec<Duration>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            credentials_base_url: "http://localhost:3000".to_string(),
            realtime_endpoint: DEFAULT_REALTIME_ENDPOINT.to_string(),
            default_model: DEFAULT_REALTIME_MODEL.to_string(),
            model_fallbacks: ModelFallback::defaults(),
            ice_gathering_timeout: DEFAULT_ICE_GATHERING_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            credential_timeout: DEFAULT_CREDENTIAL_TIMEOUT,
            audio_bitrate_kbps: None,
            trial_limit_secs: Some(DEFAULT_TRIAL_LIMIT_SECS),
            authenticated_limit_secs: Some(DEFAULT_AUTHENTICATED_LIMIT_SECS),
            meter_fft_size: DEFAULT_METER_FFT_SIZE,
            meter_frame: DEFAULT_METER_FRAME,
            sink_retry_schedule: DEFAULT_SINK_RETRY_SCHEDULE.to_vec(),
        }
    }
}

impl CallConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// A limit of `0` disables the duration policy for that tier.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let defaults = Self::default();

        let credentials_base_url = std::env::var("CREDENTIALS_BASE_URL")
            .unwrap_or(defaults.credentials_base_url)
            .trim_end_matches('/')
            .to_string();
        let realtime_endpoint =
            std::env::var("REALTIME_ENDPOINT").unwrap_or(defaults.realtime_endpoint);
        let default_model = std::env::var("REALTIME_MODEL").unwrap_or(defaults.default_model);

        let ice_gathering_timeout = parse_var::<u64>("ICE_GATHERING_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.ice_gathering_timeout);
        let negotiation_timeout = parse_var::<u64>("NEGOTIATION_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.negotiation_timeout);
        let credential_timeout = parse_var::<u64>("CREDENTIAL_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.credential_timeout);
        let audio_bitrate_kbps = parse_var::<u32>("AUDIO_BITRATE_KBPS")?;

        let trial_limit_secs = match parse_var::<u64>("TRIAL_LIMIT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(secs),
            None => defaults.trial_limit_secs,
        };
        let authenticated_limit_secs = match parse_var::<u64>("AUTHENTICATED_LIMIT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(secs),
            None => defaults.authenticated_limit_secs,
        };

        let meter_fft_size = parse_var::<usize>("METER_FFT_SIZE")?.unwrap_or(defaults.meter_fft_size);
        if !meter_fft_size.is_power_of_two() || meter_fft_size < 32 {
            return Err(ConfigError::InvalidValue(
                "METER_FFT_SIZE".to_string(),
                format!("'{}' must be a power of two >= 32", meter_fft_size),
            ));
        }
        let meter_frame = match parse_var::<u64>("METER_FRAME_MS")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue(
                    "METER_FRAME_MS".to_string(),
                    "'0' must be at least 1".to_string(),
                ));
            }
            Some(ms) => Duration::from_millis(ms),
            None => defaults.meter_frame,
        };

        Ok(Self {
            credentials_base_url,
            realtime_endpoint,
            default_model,
            model_fallbacks: defaults.model_fallbacks,
            ice_gathering_timeout,
            negotiation_timeout,
            credential_timeout,
            audio_bitrate_kbps,
            trial_limit_secs,
            authenticated_limit_secs,
            meter_fft_size,
            meter_frame,
            sink_retry_schedule: defaults.sink_retry_schedule,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}
