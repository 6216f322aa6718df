#![allow(dead_code)]

use async_trait::async_trait;
use parley_core::{
    CallConfig, CallError, CallSessionOrchestrator, EntitlementTier, Platform, SessionEvent,
    SessionSummary,
    audio_sink::AudioOutput,
    connection::{IceConnectionState, PeerConnectionFactory, PeerConnectionState, TransportEvent},
    credentials::{AuthToken, CredentialBroker, TokenGrant, TokenShape},
    error::{MediaError, MeterError, NegotiationError, SinkError, TransportError},
    media::{MediaConstraints, MediaDevices, MediaTrack, RemoteStream, TrackKind},
    meter::{AudioAnalyser, AudioAnalysisContext},
    sdp::SessionDescription,
    signaling::{OfferOptions, PeerConnection, RtcConfiguration, SdpExchange},
    state::ConnectionState,
    wire::{IceServer, IceUrls, SessionContext},
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};

pub const OFFER_SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\na=rtpmap:111 opus/48000/2\r\n";
pub const ANSWER_SDP: &str = "v=0\r\no=- 3 4 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\n";
pub const REMOTE_STREAM_ID: &str = "remote-stream";

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stops: AtomicUsize,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }
    fn kind(&self) -> TrackKind {
        self.kind
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
    fn is_live(&self) -> bool {
        self.stops() == 0
    }
}

pub struct FakeDevices {
    pub mic: Arc<FakeTrack>,
    pub camera: Arc<FakeTrack>,
    failure: Option<MediaError>,
    requests: AtomicUsize,
}

impl FakeDevices {
    fn build(failure: Option<MediaError>) -> Arc<Self> {
        Arc::new(Self {
            mic: FakeTrack::new("mic-1", TrackKind::Audio),
            camera: FakeTrack::new("cam-1", TrackKind::Video),
            failure,
            requests: AtomicUsize::new(0),
        })
    }

    pub fn camera_and_mic() -> Arc<Self> {
        Self::build(None)
    }

    pub fn failing(err: MediaError) -> Arc<Self> {
        Self::build(Some(err))
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Every handed-out track was stopped exactly once.
    pub fn all_released(&self) -> bool {
        self.mic.stops() == 1 && self.camera.stops() == 1
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let mic: Arc<dyn MediaTrack> = self.mic.clone();
        let camera: Arc<dyn MediaTrack> = self.camera.clone();
        Ok(vec![mic, camera])
    }
}

/// Reports the usual state sequence followed by a remote audio track as soon
/// as the answer is applied, before negotiation has returned. With
/// `stalls_gathering` set, ICE gathering never reports complete.
pub struct FakePeer {
    events: mpsc::UnboundedSender<TransportEvent>,
    pub ice_servers: Vec<IceServer>,
    connect_on_answer: bool,
    stalls_gathering: bool,
    gathering_waits: AtomicUsize,
    added: Mutex<Vec<TrackKind>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    closes: AtomicUsize,
}

impl FakePeer {
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn added_kinds(&self) -> Vec<TrackKind> {
        self.added.lock().unwrap().clone()
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.remote.lock().unwrap().as_ref().map(|d| d.sdp.clone())
    }

    pub fn gathering_waits(&self) -> usize {
        self.gathering_waits.load(Ordering::SeqCst)
    }
}

pub fn remote_audio(track_id: &str) -> TransportEvent {
    TransportEvent::Track {
        track_id: track_id.to_string(),
        kind: TrackKind::Audio,
        stream_id: REMOTE_STREAM_ID.to_string(),
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), TransportError> {
        self.added.lock().unwrap().push(track.kind());
        Ok(())
    }

    async fn create_offer(
        &self,
        options: OfferOptions,
    ) -> Result<SessionDescription, TransportError> {
        assert!(options.offer_to_receive_audio);
        assert!(!options.offer_to_receive_video);
        Ok(SessionDescription::offer(OFFER_SDP))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        *self.remote.lock().unwrap() = Some(desc);
        if self.connect_on_answer {
            self.emit(TransportEvent::IceConnectionState(IceConnectionState::Checking));
            self.emit(TransportEvent::PeerConnectionState(PeerConnectionState::Connecting));
            self.emit(TransportEvent::PeerConnectionState(PeerConnectionState::Connected));
            self.emit(TransportEvent::IceConnectionState(IceConnectionState::Connected));
            self.emit(remote_audio("remote-audio-1"));
        }
        Ok(())
    }

    async fn wait_for_gathering_complete(&self) {
        self.gathering_waits.fetch_add(1, Ordering::SeqCst);
        if self.stalls_gathering {
            std::future::pending::<()>().await;
        }
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakePeerFactory {
    connect_on_answer: bool,
    stalls_gathering: bool,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new(connect_on_answer: bool) -> Arc<Self> {
        Arc::new(Self {
            connect_on_answer,
            stalls_gathering: false,
            peers: Mutex::new(vec![]),
        })
    }

    /// Peers whose ICE gathering never completes.
    pub fn stalling() -> Arc<Self> {
        Arc::new(Self {
            connect_on_answer: true,
            stalls_gathering: true,
            peers: Mutex::new(vec![]),
        })
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.peers.lock().unwrap().last().cloned().unwrap()
    }
}

impl PeerConnectionFactory for FakePeerFactory {
    fn create(
        &self,
        config: &RtcConfiguration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let peer = Arc::new(FakePeer {
            events,
            ice_servers: config.ice_servers.clone(),
            connect_on_answer: self.connect_on_answer,
            stalls_gathering: self.stalls_gathering,
            gathering_waits: AtomicUsize::new(0),
            added: Mutex::new(vec![]),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            closes: AtomicUsize::new(0),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

#[derive(Default)]
pub struct FakeOutput {
    pub plays: AtomicUsize,
    pub detaches: AtomicUsize,
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn play(&self, _stream: &RemoteStream) -> Result<(), SinkError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn detach(&self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}

struct FixedAnalyser {
    value: u8,
    closes: Arc<AtomicUsize>,
}

impl AudioAnalyser for FixedAnalyser {
    fn fill_frequency_data(&mut self, bins: &mut [u8]) {
        bins.fill(self.value);
    }
    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeAnalysis {
    pub created: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl AudioAnalysisContext for FakeAnalysis {
    fn create_analyser(
        &self,
        _stream: &RemoteStream,
        _fft_size: usize,
    ) -> Result<Box<dyn AudioAnalyser>, MeterError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FixedAnalyser {
            value: 128,
            closes: self.closes.clone(),
        }))
    }
}

/// In-memory credentials; optionally parks the relay call until released.
#[derive(Default)]
pub struct StaticBroker {
    pub gate: Option<Arc<Notify>>,
    pub relay_calls: AtomicUsize,
    pub token_calls: AtomicUsize,
}

impl StaticBroker {
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }
}

#[async_trait]
impl CredentialBroker for StaticBroker {
    async fn fetch_relay_servers(&self) -> Result<Vec<IceServer>, CallError> {
        self.relay_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(vec![IceServer {
            urls: IceUrls::One("stun:stun.example.org:3478".into()),
            username: None,
            credential: None,
        }])
    }

    async fn fetch_auth_token(&self, _context: &SessionContext) -> Result<TokenGrant, CallError> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TokenGrant {
            token: AuthToken::new("ek_test", TokenShape::Canonical, None),
            model: Some("gpt-realtime".into()),
        })
    }
}

#[derive(Default)]
pub struct StaticExchange {
    pub gate: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl SdpExchange for StaticExchange {
    async fn exchange(
        &self,
        model: &str,
        token: &AuthToken,
        _offer_sdp: &str,
    ) -> Result<String, NegotiationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(model, "gpt-realtime");
        assert_eq!(token.expose(), "ek_test");
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(ANSWER_SDP.to_string())
    }
}

pub struct Harness {
    pub devices: Arc<FakeDevices>,
    pub factory: Arc<FakePeerFactory>,
    pub output: Arc<FakeOutput>,
    pub analysis: Arc<FakeAnalysis>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_devices(FakeDevices::camera_and_mic())
    }

    pub fn with_devices(devices: Arc<FakeDevices>) -> Self {
        Self {
            devices,
            factory: FakePeerFactory::new(true),
            output: Arc::new(FakeOutput::default()),
            analysis: Arc::new(FakeAnalysis::default()),
        }
    }

    pub fn with_stalled_gathering() -> Self {
        Self {
            factory: FakePeerFactory::stalling(),
            ..Self::new()
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            media_devices: self.devices.clone(),
            preview: None,
            peer_connections: self.factory.clone(),
            audio_output: self.output.clone(),
            audio_analysis: self.analysis.clone(),
        }
    }

    pub fn orchestrator(
        &self,
        tier: EntitlementTier,
        broker: Arc<dyn CredentialBroker>,
        exchange: Arc<dyn SdpExchange>,
    ) -> CallSessionOrchestrator {
        CallSessionOrchestrator::new(self.platform(), broker, exchange, tier, CallConfig::default())
    }

    pub fn default_orchestrator(&self, tier: EntitlementTier) -> CallSessionOrchestrator {
        self.orchestrator(
            tier,
            Arc::new(StaticBroker::default()),
            Arc::new(StaticExchange::default()),
        )
    }
}

pub async fn wait_for_state(orchestrator: &CallSessionOrchestrator, state: ConnectionState) {
    let mut rx = orchestrator.subscribe_state();
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| s.state == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn summaries(events: &[SessionEvent]) -> Vec<SessionSummary> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::SessionEnded(summary) => Some(summary.clone()),
            _ => None,
        })
        .collect()
}

pub fn notifications(events: &[SessionEvent]) -> Vec<CallError> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Notification(err) => Some(err.clone()),
            _ => None,
        })
        .collect()
}
