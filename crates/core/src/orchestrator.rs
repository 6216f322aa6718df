//! The call session lifecycle.
//!
//! [`CallSessionOrchestrator`] owns at most one [`ActiveSession`] at a time.
//! Setup runs as a sequence of awaits; after each one the attempt re-checks
//! that it is still the live session, and anything it acquired after being
//! superseded is released on the spot. Every periodic task (duration
//! ticker, transport pump, level meter, sink retries) holds only a weak
//! reference back to the orchestrator and is cancelled by teardown.

use crate::{
    audio_sink::{AudioOutput, AudioSinkManager},
    config::CallConfig,
    connection::{
        ConnectionStateMachine, PeerConnectionFactory, Transition, TransportEvent, TransportSignal,
    },
    credentials::{CredentialBroker, fetch_credentials},
    error::{CallError, NegotiationError},
    media::{
        AcquisitionMode, LocalStream, MediaAcquisition, MediaConstraints, MediaDevices,
        PreviewSink, RemoteStream, TrackKind,
    },
    meter::{AudioAnalysisContext, AudioLevelMeter, MeterHandle},
    policy::{PolicyDecision, PolicyTable, SessionPolicy},
    signaling::{NegotiationOptions, PeerConnection, RtcConfiguration, SdpExchange, negotiate},
    state::{
        CallSnapshot, ConnectionState, EntitlementTier, SessionEvent, SessionSummary,
        TerminationReason,
    },
    task::TaskSlot,
    wire::SessionContext,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

const TICK: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Platform primitives the orchestrator drives.
#[derive(Clone)]
pub struct Platform {
    pub media_devices: Arc<dyn MediaDevices>,
    pub preview: Option<Arc<dyn PreviewSink>>,
    pub peer_connections: Arc<dyn PeerConnectionFactory>,
    pub audio_output: Arc<dyn AudioOutput>,
    pub audio_analysis: Arc<dyn AudioAnalysisContext>,
}

/// Result of [`CallSessionOrchestrator::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Negotiation finished; the call reaches `Connected` when the transport does.
    Started,
    /// A session was already in flight; nothing was done.
    AlreadyActive,
    /// The attempt was ended or superseded before it finished.
    Aborted,
    Failed(CallError),
}

enum SetupError {
    Aborted,
    Failed(CallError),
}

fn failed(err: impl Into<CallError>) -> SetupError {
    SetupError::Failed(err.into())
}

struct ActiveSession {
    id: Uuid,
    alive: Arc<AtomicBool>,
    machine: ConnectionStateMachine,
    local_stream: Option<Arc<LocalStream>>,
    peer: Option<Arc<dyn PeerConnection>>,
    remote_stream: Option<Arc<RemoteStream>>,
    connected_at: Option<Instant>,
    muted: bool,
    transcript: String,
    ticker: TaskSlot,
    pump: TaskSlot,
    meter: Option<MeterHandle>,
}

impl ActiveSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            alive: Arc::new(AtomicBool::new(true)),
            machine: ConnectionStateMachine::new(),
            local_stream: None,
            peer: None,
            remote_stream: None,
            connected_at: None,
            muted: false,
            transcript: String::new(),
            ticker: TaskSlot::new(),
            pump: TaskSlot::new(),
            meter: None,
        }
    }
}

struct Inner {
    config: CallConfig,
    tier: EntitlementTier,
    policy: SessionPolicy,
    constraints: MediaConstraints,
    negotiation: NegotiationOptions,
    media: MediaAcquisition,
    broker: Arc<dyn CredentialBroker>,
    exchange: Arc<dyn SdpExchange>,
    peer_connections: Arc<dyn PeerConnectionFactory>,
    sink: AudioSinkManager,
    meter: AudioLevelMeter,
    session: Mutex<Option<ActiveSession>>,
    snapshot: watch::Sender<CallSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

pub struct CallSessionOrchestrator {
    inner: Arc<Inner>,
}

impl CallSessionOrchestrator {
    /// Builds an orchestrator whose duration policy comes from `config`.
    pub fn new(
        platform: Platform,
        broker: Arc<dyn CredentialBroker>,
        exchange: Arc<dyn SdpExchange>,
        tier: EntitlementTier,
        config: CallConfig,
    ) -> Self {
        let policy = SessionPolicy::new(PolicyTable::from_config(&config));
        Self::with_policy(platform, broker, exchange, tier, config, policy)
    }

    pub fn with_policy(
        platform: Platform,
        broker: Arc<dyn CredentialBroker>,
        exchange: Arc<dyn SdpExchange>,
        tier: EntitlementTier,
        config: CallConfig,
        policy: SessionPolicy,
    ) -> Self {
        // Trial callers get a call even without a camera.
        let mode = match tier {
            EntitlementTier::Trial => AcquisitionMode::Tolerant,
            EntitlementTier::Authenticated => AcquisitionMode::Strict,
        };
        let negotiation = NegotiationOptions {
            ice_gathering_timeout: config.ice_gathering_timeout,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            model_fallbacks: config.model_fallbacks.clone(),
        };
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Inner {
            media: MediaAcquisition::new(platform.media_devices, platform.preview, mode),
            sink: AudioSinkManager::new(platform.audio_output, config.sink_retry_schedule.clone()),
            meter: AudioLevelMeter::new(
                platform.audio_analysis,
                config.meter_fft_size,
                config.meter_frame,
            ),
            peer_connections: platform.peer_connections,
            constraints: MediaConstraints::interview(),
            negotiation,
            tier,
            policy,
            broker,
            exchange,
            config,
            session: Mutex::new(None),
            snapshot,
            events,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Starts a call. A second call while one is in flight is a no-op.
    pub async fn start(&self, context: SessionContext) -> StartOutcome {
        let (id, alive) = {
            let mut slot = self.inner.lock_session();
            if slot.is_some() {
                info!("Start ignored, a call session is already active");
                return StartOutcome::AlreadyActive;
            }
            let session = ActiveSession::new();
            let handle = (session.id, session.alive.clone());
            *slot = Some(session);
            handle
        };
        self.inner.snapshot.send_replace(CallSnapshot {
            session_id: Some(id),
            ..CallSnapshot::default()
        });
        self.inner.emit(SessionEvent::StateChanged(ConnectionState::New));

        let span = tracing::info_span!("call_session", session_id = %id, tier = ?self.inner.tier);
        let outcome = self
            .inner
            .run_setup(id, &alive, context)
            .instrument(span)
            .await;

        match outcome {
            Ok(()) => StartOutcome::Started,
            Err(SetupError::Aborted) => {
                info!(session_id = %id, "Call setup abandoned");
                StartOutcome::Aborted
            }
            Err(SetupError::Failed(_)) if !alive.load(Ordering::Acquire) => {
                info!(session_id = %id, "Call setup abandoned");
                StartOutcome::Aborted
            }
            Err(SetupError::Failed(err)) => {
                warn!(session_id = %id, error = %err, "Call setup failed");
                self.inner.emit(SessionEvent::Notification(err.clone()));
                self.inner
                    .teardown(Some(id), TerminationReason::SetupFailed);
                StartOutcome::Failed(err)
            }
        }
    }

    /// Ends the current call. Returns `false` if there was nothing to end.
    pub fn end(&self) -> bool {
        self.inner.teardown(None, TerminationReason::UserEnded)
    }

    /// Tears down for an owner that is going away.
    pub fn shutdown(&self) {
        self.inner.teardown(None, TerminationReason::Unmounted);
    }

    /// Flips the microphone mute flag and returns the new value. Without a
    /// session this does nothing and returns `false`.
    pub fn toggle_mute(&self) -> bool {
        let muted = {
            let mut slot = self.inner.lock_session();
            let Some(session) = slot.as_mut() else {
                return false;
            };
            session.muted = !session.muted;
            if let Some(stream) = &session.local_stream {
                stream.set_audio_enabled(!session.muted);
            }
            session.muted
        };
        self.inner.snapshot.send_modify(|s| s.muted = muted);
        debug!(muted, "Microphone mute toggled");
        muted
    }

    /// Forwards a user gesture so a blocked audio sink can start.
    pub async fn notify_user_interaction(&self) -> bool {
        self.inner.sink.on_user_interaction().await
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock_session().is_some()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for CallSessionOrchestrator {
    fn drop(&mut self) {
        self.inner.teardown(None, TerminationReason::Unmounted);
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the session only if `id` is still the live one.
    fn with_live<R>(&self, id: Uuid, f: impl FnOnce(&mut ActiveSession) -> R) -> Option<R> {
        let mut slot = self.lock_session();
        slot.as_mut()
            .filter(|s| s.id == id && s.alive.load(Ordering::Acquire))
            .map(f)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_state(&self, state: ConnectionState) {
        self.snapshot.send_modify(|s| s.state = state);
        self.emit(SessionEvent::StateChanged(state));
    }

    async fn run_setup(
        self: &Arc<Self>,
        id: Uuid,
        alive: &AtomicBool,
        context: SessionContext,
    ) -> Result<(), SetupError> {
        let stream = Arc::new(self.media.acquire(&self.constraints).await.map_err(failed)?);
        let installed = self.with_live(id, |session| {
            stream.set_audio_enabled(!session.muted);
            session.local_stream = Some(stream.clone());
        });
        if installed.is_none() {
            self.media.release(&stream);
            return Err(SetupError::Aborted);
        }

        let credentials =
            fetch_credentials(self.broker.as_ref(), &context, &self.config.default_model)
                .await
                .map_err(SetupError::Failed)?;
        if !alive.load(Ordering::Acquire) {
            return Err(SetupError::Aborted);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let rtc = RtcConfiguration {
            ice_servers: credentials.relay_servers.clone(),
        };
        let pc = self
            .peer_connections
            .create(&rtc, events_tx)
            .map_err(|e| failed(NegotiationError::from(e)))?;
        let transition = self.with_live(id, |session| {
            session.peer = Some(pc.clone());
            session.machine.begin_negotiation()
        });
        match transition {
            None => {
                pc.close();
                return Err(SetupError::Aborted);
            }
            Some(Transition::Moved(state)) => self.publish_state(state),
            Some(_) => {}
        }

        let negotiated = negotiate(
            pc.as_ref(),
            &stream,
            &credentials,
            self.exchange.as_ref(),
            &self.negotiation,
            alive,
        )
        .await
        .map_err(|err| match err {
            NegotiationError::Aborted => SetupError::Aborted,
            err => failed(err),
        })?;
        info!(
            model = %negotiated.model,
            gathering_timed_out = negotiated.gathering_timed_out,
            "Call negotiated"
        );

        // Transport events buffered during the handshake are processed only
        // from here on, once both descriptions are known to be set.
        let weak = Arc::downgrade(self);
        self.with_live(id, move |session| {
            session.machine.mark_local_description();
            session.machine.mark_remote_description();
            session
                .pump
                .replace(tokio::spawn(pump_transport_events(weak, id, events_rx)));
        })
        .ok_or(SetupError::Aborted)
    }

    /// Returns whether the pump should keep running.
    fn handle_transport_event(self: &Arc<Self>, id: Uuid, event: TransportEvent) -> bool {
        let signal = match event {
            TransportEvent::PeerConnectionState(state) => TransportSignal::from_peer(state),
            TransportEvent::IceConnectionState(state) => TransportSignal::from_ice(state),
            TransportEvent::Track {
                track_id,
                kind: TrackKind::Audio,
                stream_id,
            } => return self.on_remote_audio(id, stream_id, track_id),
            TransportEvent::Track { track_id, kind, .. } => {
                debug!(%kind, track_id, "Remote non-audio track ignored");
                return true;
            }
            TransportEvent::TranscriptDelta(text) => {
                return self
                    .with_live(id, |session| session.transcript.push_str(&text))
                    .is_some();
            }
        };
        match signal {
            Some(signal) => self.apply_signal(id, signal),
            None => true,
        }
    }

    fn apply_signal(self: &Arc<Self>, id: Uuid, signal: TransportSignal) -> bool {
        let weak = Arc::downgrade(self);
        let Some(transition) = self.with_live(id, |session| {
            let transition = session.machine.apply(signal);
            if transition == Transition::EnteredConnected {
                let started = Instant::now();
                session.connected_at = Some(started);
                session
                    .ticker
                    .replace(tokio::spawn(run_duration_ticker(weak, id, started)));
            }
            transition
        }) else {
            return false;
        };

        match transition {
            Transition::Moved(state) => self.publish_state(state),
            Transition::EnteredConnected => {
                let started_at = Utc::now();
                self.snapshot.send_modify(|s| {
                    s.state = ConnectionState::Connected;
                    s.started_at = Some(started_at);
                    s.elapsed_seconds = 0;
                });
                self.emit(SessionEvent::StateChanged(ConnectionState::Connected));
                info!(session_id = %id, "Call connected");
            }
            Transition::Recovered => {
                info!(session_id = %id, "Transport recovered");
                self.publish_state(ConnectionState::Connected);
            }
            Transition::AlreadyConnected => debug!("Duplicate connected report"),
            Transition::Degraded {
                state,
                was_connected,
            } => {
                warn!(session_id = %id, %state, was_connected, "Transport lost, ending call");
                let reason = if was_connected {
                    TerminationReason::TransportFailure
                } else {
                    TerminationReason::SetupFailed
                };
                self.emit(SessionEvent::Notification(CallError::TransportFailure(
                    format!("connection {state}"),
                )));
                self.teardown(Some(id), reason);
                return false;
            }
            Transition::Unchanged | Transition::Ignored => {}
        }
        true
    }

    /// Replaces the remote stream with one that includes `track_id`, then
    /// re-routes playback and restarts the level meter on it.
    fn on_remote_audio(self: &Arc<Self>, id: Uuid, stream_id: String, track_id: String) -> bool {
        let weak = Arc::downgrade(self);
        let remote = self.with_live(id, |session| {
            let mut audio_track_ids = match &session.remote_stream {
                Some(current) if current.id == stream_id => current.audio_track_ids.clone(),
                _ => Vec::new(),
            };
            if !audio_track_ids.contains(&track_id) {
                audio_track_ids.push(track_id);
            }
            let remote = Arc::new(RemoteStream {
                id: stream_id,
                audio_track_ids,
            });
            session.remote_stream = Some(remote.clone());
            self.sink.install(remote.clone());

            if let Some(previous) = session.meter.take() {
                previous.cancel();
            }
            let on_level = move |level: f32| {
                if let Some(inner) = weak.upgrade() {
                    inner.snapshot.send_if_modified(|s| {
                        if s.session_id != Some(id) || s.audio_level == level {
                            return false;
                        }
                        s.audio_level = level;
                        true
                    });
                }
            };
            match self.meter.start(&remote, on_level) {
                Ok(handle) => session.meter = Some(handle),
                Err(e) => warn!(error = %e, "Audio level meter unavailable"),
            }
            remote
        });

        let Some(remote) = remote else {
            return false;
        };
        info!(
            stream = %remote.id,
            tracks = remote.audio_track_ids.len(),
            "Remote audio track received"
        );
        self.snapshot
            .send_modify(|s| s.remote_stream = Some(remote));
        true
    }

    /// Returns whether the ticker should keep running.
    fn on_tick(&self, id: Uuid, elapsed_seconds: u64) -> bool {
        if self.with_live(id, |_| ()).is_none() {
            return false;
        }
        self.snapshot
            .send_modify(|s| s.elapsed_seconds = elapsed_seconds);

        if self.policy.evaluate(self.tier, elapsed_seconds) == PolicyDecision::Terminate {
            info!(
                session_id = %id,
                elapsed_seconds,
                tier = ?self.tier,
                "Session duration limit reached"
            );
            self.teardown(Some(id), TerminationReason::PolicyTimeout);
            return false;
        }
        true
    }

    /// Releases everything the session holds. When `only` is set, a session
    /// with a different id is left alone. Returns whether anything was torn
    /// down; repeated calls are no-ops.
    fn teardown(&self, only: Option<Uuid>, reason: TerminationReason) -> bool {
        let summary = {
            let mut slot = self.lock_session();
            if !slot
                .as_ref()
                .is_some_and(|s| only.is_none_or(|id| s.id == id))
            {
                return false;
            }
            let Some(mut session) = slot.take() else {
                return false;
            };
            session.alive.store(false, Ordering::Release);

            session.ticker.cancel();
            session.pump.cancel();
            if let Some(meter) = session.meter.take() {
                meter.cancel();
            }
            self.sink.detach();
            if let Some(peer) = session.peer.take() {
                peer.close();
            }
            if let Some(stream) = session.local_stream.take() {
                self.media.release(&stream);
            }
            session.machine.finish(reason.final_state());

            let transcript = std::mem::take(&mut session.transcript);
            SessionSummary {
                session_id: session.id,
                reason,
                elapsed_seconds: session
                    .connected_at
                    .map_or(0, |started| started.elapsed().as_secs()),
                transcript: (!transcript.is_empty()).then_some(transcript),
            }
        };

        let final_state = reason.final_state();
        self.snapshot.send_modify(|s| {
            s.state = final_state;
            s.audio_level = 0.0;
            s.remote_stream = None;
        });
        self.emit(SessionEvent::StateChanged(final_state));
        info!(
            session_id = %summary.session_id,
            reason = ?reason,
            elapsed_seconds = summary.elapsed_seconds,
            "Call session ended"
        );
        self.emit(SessionEvent::SessionEnded(summary));
        true
    }
}

async fn pump_transport_events(
    inner: Weak<Inner>,
    id: Uuid,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.handle_transport_event(id, event) {
            break;
        }
    }
    debug!(session_id = %id, "Transport event pump stopped");
}

async fn run_duration_ticker(inner: Weak<Inner>, id: Uuid, started: Instant) {
    let mut ticker = tokio::time::interval_at(started + TICK, TICK);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.on_tick(id, started.elapsed().as_secs()) {
            break;
        }
    }
}
