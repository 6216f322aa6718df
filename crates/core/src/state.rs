//! Public session state as observed by the UI layer.

use crate::{error::CallError, media::RemoteStream};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// The call's connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Checking,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    UserEnded,
    PolicyTimeout,
    /// The transport dropped after the call was established.
    TransportFailure,
    /// The owning component went away.
    Unmounted,
    /// The attempt failed before the transport was ever established.
    SetupFailed,
}

impl TerminationReason {
    /// The state a session is left in after teardown for this reason.
    pub fn final_state(self) -> ConnectionState {
        match self {
            Self::TransportFailure | Self::SetupFailed => ConnectionState::Failed,
            Self::UserEnded | Self::PolicyTimeout | Self::Unmounted => ConnectionState::Closed,
        }
    }
}

/// The caller's permission level; selects the duration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementTier {
    Trial,
    Authenticated,
}

/// Everything the UI renders, republished on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub session_id: Option<Uuid>,
    pub state: ConnectionState,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub muted: bool,
    /// Smoothed remote energy in `[0, 1]`.
    pub audio_level: f32,
    #[serde(skip)]
    pub remote_stream: Option<Arc<RemoteStream>>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            session_id: None,
            state: ConnectionState::New,
            started_at: None,
            elapsed_seconds: 0,
            muted: false,
            audio_level: 0.0,
            remote_stream: None,
        }
    }
}

/// Handed to the results layer once a session is over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub reason: TerminationReason,
    pub elapsed_seconds: u64,
    pub transcript: Option<String>,
}

/// Discrete notifications from the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// A user-facing error notification.
    Notification(CallError),
    SessionEnded(SessionSummary),
}
