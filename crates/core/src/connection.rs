//! Maps low-level transport events onto the public [`ConnectionState`].

use crate::{
    error::TransportError,
    media::TrackKind,
    signaling::{PeerConnection, RtcConfiguration},
    state::ConnectionState,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// `RTCPeerConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// `RTCIceConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks raised by the platform peer connection, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeerConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    Track {
        track_id: String,
        kind: TrackKind,
        stream_id: String,
    },
    /// Assistant transcript text from the realtime events channel.
    TranscriptDelta(String),
}

/// Creates a peer connection that reports its callbacks on `events`.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: &RtcConfiguration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

/// A transport state change, with peer and ICE callbacks folded together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    Checking,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportSignal {
    pub fn from_peer(state: PeerConnectionState) -> Option<Self> {
        match state {
            PeerConnectionState::New => None,
            PeerConnectionState::Connecting => Some(Self::Connecting),
            PeerConnectionState::Connected => Some(Self::Connected),
            PeerConnectionState::Disconnected => Some(Self::Disconnected),
            PeerConnectionState::Failed => Some(Self::Failed),
            PeerConnectionState::Closed => Some(Self::Closed),
        }
    }

    pub fn from_ice(state: IceConnectionState) -> Option<Self> {
        match state {
            IceConnectionState::New => None,
            IceConnectionState::Checking => Some(Self::Checking),
            IceConnectionState::Connected | IceConnectionState::Completed => Some(Self::Connected),
            IceConnectionState::Disconnected => Some(Self::Disconnected),
            IceConnectionState::Failed => Some(Self::Failed),
            IceConnectionState::Closed => Some(Self::Closed),
        }
    }
}

/// What applying a signal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No visible change.
    Unchanged,
    /// The signal was not acceptable in the current state and was dropped.
    Ignored,
    Moved(ConnectionState),
    /// First arrival in `Connected` for this session.
    EnteredConnected,
    /// A duplicate `Connected` report.
    AlreadyConnected,
    /// `Disconnected` back to `Connected`.
    Recovered,
    /// The transport degraded to `Disconnected`, `Failed` or `Closed`.
    Degraded {
        state: ConnectionState,
        was_connected: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    local_description: bool,
    remote_description: bool,
    ever_connected: bool,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::New,
            local_description: false,
            remote_description: false,
            ever_connected: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn begin_negotiation(&mut self) -> Transition {
        if self.state == ConnectionState::New {
            self.state = ConnectionState::Connecting;
            Transition::Moved(ConnectionState::Connecting)
        } else {
            Transition::Unchanged
        }
    }

    pub fn mark_local_description(&mut self) {
        self.local_description = true;
    }

    pub fn mark_remote_description(&mut self) {
        self.remote_description = true;
    }

    pub fn descriptions_ready(&self) -> bool {
        self.local_description && self.remote_description
    }

    pub fn apply(&mut self, signal: TransportSignal) -> Transition {
        use ConnectionState as S;

        if self.state.is_terminal() {
            debug!(?signal, state = %self.state, "Transport signal after terminal state dropped");
            return Transition::Ignored;
        }

        match signal {
            TransportSignal::Connected => {
                if !self.descriptions_ready() {
                    warn!(state = %self.state, "Transport reported connected before both descriptions were set");
                    return Transition::Ignored;
                }
                match self.state {
                    S::Connected => Transition::AlreadyConnected,
                    S::Disconnected if self.ever_connected => {
                        self.state = S::Connected;
                        Transition::Recovered
                    }
                    _ => {
                        self.state = S::Connected;
                        if self.ever_connected {
                            Transition::Recovered
                        } else {
                            self.ever_connected = true;
                            Transition::EnteredConnected
                        }
                    }
                }
            }
            TransportSignal::Checking | TransportSignal::Connecting => {
                let target = if signal == TransportSignal::Checking {
                    S::Checking
                } else {
                    S::Connecting
                };
                match self.state {
                    S::New | S::Checking | S::Connecting if self.state != target => {
                        self.state = target;
                        Transition::Moved(target)
                    }
                    _ => Transition::Unchanged,
                }
            }
            TransportSignal::Disconnected | TransportSignal::Failed | TransportSignal::Closed => {
                let target = match signal {
                    TransportSignal::Disconnected => S::Disconnected,
                    TransportSignal::Failed => S::Failed,
                    _ => S::Closed,
                };
                if self.state == target {
                    return Transition::Unchanged;
                }
                self.state = target;
                Transition::Degraded {
                    state: target,
                    was_connected: self.ever_connected,
                }
            }
        }
    }

    /// Forces the terminal state after teardown.
    pub fn finish(&mut self, state: ConnectionState) {
        self.state = state;
    }
}
