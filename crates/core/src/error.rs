//! Error taxonomy for the call session core.
//!
//! Every failure that can occur while setting up or running a call is mapped
//! onto [`CallError`] at the orchestrator boundary, where it becomes a
//! user-facing notification instead of propagating further.

/// Failures while opening or using local capture devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("Camera or microphone permission was denied")]
    PermissionDenied,
    #[error("No usable camera or microphone was found")]
    DeviceNotFound,
    #[error("Media device error: {0}")]
    Other(String),
}

/// Failures reported by the peer connection implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Peer connection error: {0}")]
pub struct TransportError(pub String);

/// Failures of the offer/answer handshake with the realtime endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    /// The endpoint answered with a non-2xx status.
    #[error("Realtime endpoint returned {status}: {message}")]
    Http {
        status: u16,
        message: String,
        error_type: Option<String>,
    },
    #[error("Realtime endpoint did not answer in time")]
    Timeout,
    /// The request never produced an HTTP response (connect/send failure).
    #[error("Could not reach realtime endpoint: {0}")]
    Network(String),
    /// The local peer connection rejected an offer or answer.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The attempt was ended while the handshake was in flight.
    #[error("Negotiation abandoned")]
    Aborted,
}

impl NegotiationError {
    /// Whether this failure is eligible for the alternate-model retry.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Reasons a credential document was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialParseError {
    #[error("Credential response is not a JSON object")]
    NotAnObject,
    #[error("Credential response matched none of the accepted token shapes")]
    NoAcceptedShape,
    #[error("Credential response carries a raw long-lived secret; refusing to use it")]
    RawSecretRejected,
}

/// The single error type surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("Camera or microphone permission was denied")]
    PermissionDenied,
    #[error("No usable camera or microphone was found")]
    DeviceNotFound,
    #[error("Media device error: {0}")]
    Media(String),
    #[error("Failed to fetch call credentials: {0}")]
    CredentialFetchFailed(String),
    #[error("Call negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    /// The transport dropped after the call was established.
    #[error("Connection lost: {0}")]
    TransportFailure(String),
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied => Self::PermissionDenied,
            MediaError::DeviceNotFound => Self::DeviceNotFound,
            MediaError::Other(message) => Self::Media(message),
        }
    }
}

impl From<CredentialParseError> for CallError {
    fn from(err: CredentialParseError) -> Self {
        Self::CredentialFetchFailed(err.to_string())
    }
}

/// Failures of the audible output sink. Never treated as call failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("Playback blocked by autoplay policy")]
    AutoplayBlocked,
    #[error("Audio output error: {0}")]
    Other(String),
}

/// Failures creating the audio analysis graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Audio analysis unavailable: {0}")]
pub struct MeterError(pub String);
