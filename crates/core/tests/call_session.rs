mod common;

use approx::assert_abs_diff_eq;
use common::*;
use parley_core::{
    CallError, ConnectionState, EntitlementTier, SessionEvent, StartOutcome, TerminationReason,
    connection::{IceConnectionState, PeerConnectionState, TransportEvent},
    error::MediaError,
    media::{MediaTrack, TrackKind},
    wire::SessionContext,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::Notify;

fn context() -> SessionContext {
    SessionContext {
        case_id: Some("case-42".into()),
        question: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_call_connects_ticks_and_ends() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Trial);
    let mut events = orchestrator.subscribe_events();

    assert_eq!(orchestrator.start(context()).await, StartOutcome::Started);
    wait_for_state(&orchestrator, ConnectionState::Connected).await;

    let peer = harness.factory.last();
    assert_eq!(peer.added_kinds(), vec![TrackKind::Audio, TrackKind::Video]);
    assert_eq!(peer.remote_sdp().as_deref(), Some(ANSWER_SDP));
    assert_eq!(peer.ice_servers.len(), 1);

    let snapshot = orchestrator.snapshot();
    assert!(snapshot.session_id.is_some());
    assert!(snapshot.started_at.is_some());

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(orchestrator.snapshot().elapsed_seconds, 3);

    assert!(orchestrator.end());
    assert_eq!(orchestrator.snapshot().state, ConnectionState::Closed);

    let events = drain(&mut events);
    let connected = events
        .iter()
        .filter(|e| **e == SessionEvent::StateChanged(ConnectionState::Connected))
        .count();
    assert_eq!(connected, 1);

    let ended = summaries(&events);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].reason, TerminationReason::UserEnded);
    assert_eq!(ended[0].elapsed_seconds, 3);
    assert_eq!(Some(ended[0].session_id), snapshot.session_id);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_is_idempotent() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Trial);
    let mut events = orchestrator.subscribe_events();

    orchestrator.start(context()).await;
    wait_for_state(&orchestrator, ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(orchestrator.end());
    assert!(!orchestrator.end());
    orchestrator.shutdown();

    let peer = harness.factory.last();
    assert!(harness.devices.all_released());
    assert_eq!(peer.closes(), 1);
    assert_eq!(harness.output.detaches.load(Ordering::SeqCst), 1);
    assert_eq!(harness.analysis.closes.load(Ordering::SeqCst), 1);
    assert_eq!(summaries(&drain(&mut events)).len(), 1);
    assert!(!orchestrator.is_active());
}

#[tokio::test(start_paused = true)]
async fn test_start_while_active_is_a_no_op() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Trial);

    let (first, second) = tokio::join!(orchestrator.start(context()), orchestrator.start(context()));
    let mut outcomes = vec![first, second];
    outcomes.sort_by_key(|o| matches!(o, StartOutcome::AlreadyActive));
    assert_eq!(outcomes, vec![StartOutcome::Started, StartOutcome::AlreadyActive]);

    wait_for_state(&orchestrator, ConnectionState::Connected).await;
    assert_eq!(
        orchestrator.start(context()).await,
        StartOutcome::AlreadyActive
    );
    assert_eq!(harness.devices.requests(), 1);
    assert_eq!(harness.factory.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_end_gets_a_fresh_session() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Trial);

    orchestrator.start(context()).await;
    wait_for_state(&orchestrator, ConnectionState::Connected).await;
    let first = orchestrator.snapshot().session_id;
    orchestrator.end();

    assert_eq!(orchestrator.start(context()).await, StartOutcome::Started);
    wait_for_state(&orchestrator, ConnectionState::Connected).await;
    let second = orchestrator.snapshot();

    assert_ne!(second.session_id, first);
    assert_eq!(second.elapsed_seconds, 0);
    assert_eq!(harness.factory.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_trial_policy_ends_call_exactly_once() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Trial);
    let mut events = orchestrator.subscribe_events();

    orchestrator.start(context()).await;
    wait_for_state(&orchestrator, ConnectionState::Connected).await;

    tokio::time::sleep(Duration::from_secs(59) + Duration::from_millis(500)).await;
    assert_eq!(orchestrator.snapshot().state, ConnectionState::Connected);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Closed);
    assert_eq!(snapshot.elapsed_seconds, 60);

    let ended = summaries(&drain(&mut events));
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].reason, TerminationReason::PolicyTimeout);
    assert_eq!(ended[0].elapsed_seconds, 60);
    assert!(harness.devices.all_released());
    assert_eq!(harness.factory.last().closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_authenticated_call_outlives_trial_limit() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Authenticated);

    orchestrator.start(context()).await;
    wait_for_state(&orchestrator, ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_secs(90)).await;

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.elapsed_seconds, 90);
}

#[tokio::test(start_paused = true)]
async fn test_end_during_credential_fetch_releases_media() {
    let harness = Harness::new();
    let gate = Arc::new(Notify::new());
    let broker = Arc::new(StaticBroker::gated(gate.clone()));
    let orchestrator = harness.orchestrator(
        EntitlementTier::Trial,
        broker.clone(),
        Arc::new(StaticExchange::default()),
    );
    let mut events = orchestrator.subscribe_events();

    let (outcome, ()) = tokio::join!(orchestrator.start(context()), async {
        while broker.relay_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(orchestrator.end());
        gate.notify_one();
    });

    assert_eq!(outcome, StartOutcome::Aborted);
    assert!(harness.devices.all_released());
    assert_eq!(harness.factory.created(), 0);

    let ended = summaries(&drain(&mut events));
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].reason, TerminationReason::UserEnded);
    assert_eq!(ended[0].elapsed_seconds, 0);
}

#[tokio::test(start_paused = true)]
async fn test_end_during_negotiation_closes_peer_once() {
    let harness = Harness::new();
    let gate = Arc::new(Notify::new());
    let exchange = Arc::new(StaticExchange {
        gate: Some(gate.clone()),
        ..StaticExchange::default()
    });
    let orchestrator = harness.orchestrator(
        EntitlementTier::Trial,
        Arc::new(StaticBroker::default()),
        exchange.clone(),
    );
    let mut events = orchestrator.subscribe_events();

    let (outcome, ()) = tokio::join!(orchestrator.start(context()), async {
        while exchange.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(orchestrator.end());
        gate.notify_one();
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(outcome, StartOutcome::Aborted);
    assert_eq!(harness.factory.last().closes(), 1);
    assert!(harness.devices.all_released());
    assert!(!orchestrator.is_active());

    let events = drain(&mut events);
    assert!(!events.contains(&SessionEvent::StateChanged(ConnectionState::Connected)));
    assert_eq!(summaries(&events).len(), 1);
    assert_eq!(orchestrator.snapshot().state, ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_end_during_ice_gathering_never_posts_offer() {
    let harness = Harness::with_stalled_gathering();
    let exchange = Arc::new(StaticExchange::default());
    let orchestrator = harness.orchestrator(
        EntitlementTier::Trial,
        Arc::new(StaticBroker::default()),
        exchange.clone(),
    );
    let mut events = orchestrator.subscribe_events();

    let (outcome, ()) = tokio::join!(orchestrator.start(context()), async {
        while harness.factory.created() == 0 || harness.factory.last().gathering_waits() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(orchestrator.end());
    });
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(outcome, StartOutcome::Aborted);
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    let peer = harness.factory.last();
    assert_eq!(peer.closes(), 1);
    assert!(peer.remote_sdp().is_none());
    assert!(harness.devices.all_released());

    let events = drain(&mut events);
    assert!(notifications(&events).is_empty());
    let ended = summaries(&events);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].reason, TerminationReason::UserEnded);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_gathering_connects_after_timeout() {
    let harness = Harness::with_stalled_gathering();
    let exchange = Arc::new(StaticExchange::default());
    let orchestrator = harness.orchestrator(
        EntitlementTier::Trial,
        Arc::new(StaticBroker::default()),
        exchange.clone(),
    );

    let started = tokio::time::Instant::now();
    assert_eq!(orchestrator.start(context()).await, StartOutcome::Started);
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);

    wait_for_state(&orchestrator, ConnectionState::Connected).await;
    assert_eq!(harness.factory.last().remote_sdp().as_deref(), Some(ANSWER_SDP));
    assert!(orchestrator.end());
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_after_connect() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Trial);
    let mut events = orchestrator.subscribe_events();

    orchestrator.start(context()).await;
    wait_for_state(&orchestrator, ConnectionState::Connected).await;

    let peer = harness.factory.last();
    peer.emit(TransportEvent::PeerConnectionState(PeerConnectionState::Failed));
    wait_for_state(&orchestrator, ConnectionState::Failed).await;

    let events = drain(&mut events);
    let notified = notifications(&events);
    assert_eq!(notified.len(), 1);
    assert!(matches!(notified[0], CallError::TransportFailure(_)));

    let ended = summaries(&events);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].reason, TerminationReason::TransportFailure);

    assert!(harness.devices.all_released());
    assert_eq!(peer.closes(), 1);
    assert!(!orchestrator.is_active());
}

#[tokio::test(start_paused = true)]
async fn test_ice_disconnect_ends_the_call() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Authenticated);
    let mut events = orchestrator.subscribe_events();

    orchestrator.start(context()).await;
    wait_for_state(&orchestrator, ConnectionState::Connected).await;

    harness
        .factory
        .last()
        .emit(TransportEvent::IceConnectionState(IceConnectionState::Disconnected));
    wait_for_state(&orchestrator, ConnectionState::Failed).await;

    let ended = summaries(&drain(&mut events));
    assert_eq!(ended[0].reason, TerminationReason::TransportFailure);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_fails_setup() {
    let harness = Harness::with_devices(FakeDevices::failing(MediaError::PermissionDenied));
    let broker = Arc::new(StaticBroker::default());
    let orchestrator = harness.orchestrator(
        EntitlementTier::Authenticated,
        broker.clone(),
        Arc::new(StaticExchange::default()),
    );
    let mut events = orchestrator.subscribe_events();

    assert_eq!(
        orchestrator.start(context()).await,
        StartOutcome::Failed(CallError::PermissionDenied)
    );

    let events = drain(&mut events);
    assert_eq!(notifications(&events), vec![CallError::PermissionDenied]);
    assert_eq!(summaries(&events)[0].reason, TerminationReason::SetupFailed);
    assert_eq!(orchestrator.snapshot().state, ConnectionState::Failed);
    assert_eq!(broker.relay_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.factory.created(), 0);

    // A failed attempt leaves the orchestrator ready for another one.
    assert!(matches!(
        orchestrator.start(context()).await,
        StartOutcome::Failed(CallError::PermissionDenied)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_mute_toggles_local_audio_only() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Trial);

    assert!(!orchestrator.toggle_mute());

    orchestrator.start(context()).await;
    wait_for_state(&orchestrator, ConnectionState::Connected).await;

    assert!(orchestrator.toggle_mute());
    assert!(orchestrator.snapshot().muted);
    assert!(!harness.devices.mic.is_enabled());
    assert!(harness.devices.camera.is_enabled());

    assert!(!orchestrator.toggle_mute());
    assert!(harness.devices.mic.is_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_remote_audio_drives_sink_and_meter() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Trial);

    orchestrator.start(context()).await;
    wait_for_state(&orchestrator, ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = orchestrator.snapshot();
    let first = snapshot.remote_stream.clone().unwrap();
    assert_eq!(first.id, REMOTE_STREAM_ID);
    assert_eq!(first.audio_track_ids, vec!["remote-audio-1".to_string()]);
    assert_abs_diff_eq!(snapshot.audio_level, 128.0 / 255.0, epsilon = 1e-6);
    assert_eq!(harness.output.plays.load(Ordering::SeqCst), 1);

    harness.factory.last().emit(remote_audio("remote-audio-2"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = orchestrator.snapshot().remote_stream.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.audio_track_ids.len(), 2);
    assert_eq!(first.audio_track_ids.len(), 1);
    assert_eq!(harness.analysis.created.load(Ordering::SeqCst), 2);
    assert_eq!(harness.analysis.closes.load(Ordering::SeqCst), 1);
    assert_eq!(harness.output.plays.load(Ordering::SeqCst), 2);
    assert!(orchestrator.notify_user_interaction().await);

    orchestrator.end();
    let snapshot = orchestrator.snapshot();
    assert!(snapshot.remote_stream.is_none());
    assert_abs_diff_eq!(snapshot.audio_level, 0.0);
    assert_eq!(harness.analysis.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transcript_is_handed_over_on_end() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Trial);
    let mut events = orchestrator.subscribe_events();

    orchestrator.start(context()).await;
    wait_for_state(&orchestrator, ConnectionState::Connected).await;

    let peer = harness.factory.last();
    peer.emit(TransportEvent::TranscriptDelta("Walk me through ".into()));
    peer.emit(TransportEvent::TranscriptDelta("your approach.".into()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    orchestrator.end();

    let ended = summaries(&drain(&mut events));
    assert_eq!(
        ended[0].transcript.as_deref(),
        Some("Walk me through your approach.")
    );
}

#[tokio::test(start_paused = true)]
async fn test_drop_tears_down_as_unmounted() {
    let harness = Harness::new();
    let orchestrator = harness.default_orchestrator(EntitlementTier::Trial);
    let mut events = orchestrator.subscribe_events();

    orchestrator.start(context()).await;
    wait_for_state(&orchestrator, ConnectionState::Connected).await;
    let peer = harness.factory.last();
    drop(orchestrator);

    let ended = summaries(&drain(&mut events));
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].reason, TerminationReason::Unmounted);
    assert!(harness.devices.all_released());
    assert_eq!(peer.closes(), 1);

    // Nothing left running that could touch the platform.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(harness.output.plays.load(Ordering::SeqCst), 1);
}
