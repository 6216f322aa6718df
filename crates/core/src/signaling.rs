//! One-shot SDP offer/answer handshake with the realtime endpoint.

use crate::{
    credentials::{AuthToken, Credentials},
    error::{NegotiationError, TransportError},
    media::{LocalStream, MediaTrack},
    sdp::{self, SessionDescription},
    wire::{ErrorEnvelope, IceServer},
};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Offer flags, mirroring `RTCOfferOptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl OfferOptions {
    /// The remote side only ever sends us audio.
    pub fn receive_audio_only() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
}

/// The platform peer connection.
///
/// `close` must be idempotent; it is called from every cleanup path.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), TransportError>;
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    /// The local description including every candidate gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    /// Resolves once ICE gathering reports `complete`. May never resolve.
    async fn wait_for_gathering_complete(&self);
    fn close(&self);
}

/// Posts a local offer and returns the remote answer SDP.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SdpExchange: Send + Sync {
    async fn exchange(
        &self,
        model: &str,
        token: &AuthToken,
        offer_sdp: &str,
    ) -> Result<String, NegotiationError>;
}

/// Naming convention for the alternate model tried after a network failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFallback {
    pub pattern: String,
    pub replacement: String,
}

impl ModelFallback {
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    /// Most specific rule first.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("gpt-realtime-mini", "gpt-4o-mini-realtime-preview"),
            Self::new("gpt-realtime", "gpt-4o-realtime-preview"),
        ]
    }
}

/// The first rule whose pattern occurs in `model`, applied once.
pub fn alternate_model(fallbacks: &[ModelFallback], model: &str) -> Option<String> {
    fallbacks
        .iter()
        .find(|rule| model.contains(&rule.pattern))
        .map(|rule| model.replacen(&rule.pattern, &rule.replacement, 1))
        .filter(|alternate| alternate != model)
}

#[derive(Debug, Clone)]
pub struct NegotiationOptions {
    pub ice_gathering_timeout: Duration,
    pub audio_bitrate_kbps: Option<u32>,
    pub model_fallbacks: Vec<ModelFallback>,
}

/// What the handshake settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub model: String,
    pub gathering_timed_out: bool,
}

fn ensure_wanted(alive: &AtomicBool) -> Result<(), NegotiationError> {
    if alive.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(NegotiationError::Aborted)
    }
}

/// Runs the full offer/answer handshake on `pc`.
///
/// On success both descriptions are set. Transport state events raised by
/// `pc` during the handshake are the caller's to observe. Once `alive` is
/// cleared the handshake stops at its next step with
/// [`NegotiationError::Aborted`]; the offer is never posted after that.
#[instrument(skip_all, fields(model = %credentials.model))]
pub async fn negotiate(
    pc: &dyn PeerConnection,
    stream: &LocalStream,
    credentials: &Credentials,
    exchange: &dyn SdpExchange,
    options: &NegotiationOptions,
    alive: &AtomicBool,
) -> Result<NegotiatedSession, NegotiationError> {
    // Audio first so it gets the first transceiver and encoder priority.
    for track in stream.audio_tracks().chain(stream.video_tracks()) {
        pc.add_track(track.clone()).await?;
        debug!(kind = %track.kind(), id = track.id(), "Local track added");
    }
    ensure_wanted(alive)?;

    let offer = pc.create_offer(OfferOptions::receive_audio_only()).await?;
    ensure_wanted(alive)?;
    let offer = match options.audio_bitrate_kbps {
        Some(kbps) => match sdp::set_audio_bandwidth(&offer.sdp, kbps) {
            Some(rewritten) => SessionDescription::offer(rewritten),
            None => {
                debug!("Offer has no audio section; bandwidth hint skipped");
                offer
            }
        },
        None => offer,
    };
    pc.set_local_description(offer.clone()).await?;
    ensure_wanted(alive)?;

    let gathering_timed_out = tokio::select! {
        _ = pc.wait_for_gathering_complete() => false,
        _ = tokio::time::sleep(options.ice_gathering_timeout) => true,
    };
    if gathering_timed_out {
        warn!(
            timeout_ms = options.ice_gathering_timeout.as_millis() as u64,
            "ICE gathering did not complete in time, sending candidates gathered so far"
        );
    }
    ensure_wanted(alive)?;
    let local_sdp = pc
        .local_description()
        .await
        .map(|desc| desc.sdp)
        .unwrap_or(offer.sdp);
    ensure_wanted(alive)?;

    let (answer, model) = exchange_with_fallback(
        exchange,
        &credentials.auth_token,
        &credentials.model,
        &local_sdp,
        &options.model_fallbacks,
    )
    .await?;
    ensure_wanted(alive)?;

    pc.set_remote_description(SessionDescription::answer(answer))
        .await?;
    info!(%model, "Remote description applied");

    Ok(NegotiatedSession {
        model,
        gathering_timed_out,
    })
}

/// Posts the offer, retrying once with the alternate model after a network
/// failure. Returns the answer and the model that produced it.
pub async fn exchange_with_fallback(
    exchange: &dyn SdpExchange,
    token: &AuthToken,
    model: &str,
    offer_sdp: &str,
    fallbacks: &[ModelFallback],
) -> Result<(String, String), NegotiationError> {
    match exchange.exchange(model, token, offer_sdp).await {
        Ok(answer) => Ok((answer, model.to_string())),
        Err(err) if err.is_network() => {
            let Some(alternate) = alternate_model(fallbacks, model) else {
                return Err(err);
            };
            warn!(%model, %alternate, error = %err, "Offer post failed, retrying with alternate model");
            let answer = exchange.exchange(&alternate, token, offer_sdp).await?;
            Ok((answer, alternate))
        }
        Err(err) => Err(err),
    }
}

/// [`SdpExchange`] over HTTPS: `POST <endpoint>?model=<id>` with a raw SDP body.
pub struct HttpSdpExchange {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpSdpExchange {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

fn request_failed(err: reqwest::Error) -> NegotiationError {
    if err.is_timeout() {
        NegotiationError::Timeout
    } else {
        NegotiationError::Network(err.to_string())
    }
}

#[async_trait]
impl SdpExchange for HttpSdpExchange {
    async fn exchange(
        &self,
        model: &str,
        token: &AuthToken,
        offer_sdp: &str,
    ) -> Result<String, NegotiationError> {
        let url = format!("{}?model={}", self.endpoint, model);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token.expose())
            .header("Content-Type", "application/sdp")
            .body(offer_sdp.to_string())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status();
        let body = response.text().await.map_err(request_failed)?;
        if status.is_success() {
            return Ok(body);
        }

        let (message, error_type) = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => (envelope.error.message, envelope.error.error_type),
            Err(_) => (body, None),
        };
        warn!(status = status.as_u16(), %message, "Realtime endpoint rejected offer");
        Err(NegotiationError::Http {
            status: status.as_u16(),
            message,
            error_type,
        })
    }
}
