//! Client-side core of a real-time AI voice interview.
//!
//! The crate acquires local media, fetches short-lived call credentials,
//! negotiates a peer connection with the realtime endpoint, and supervises
//! the live call until it is ended by the user, the duration policy or the
//! transport. Platform primitives (capture devices, the peer connection and
//! audio output) are traits so the same orchestration runs against a
//! browser bridge, a native stack or test doubles.

pub mod audio_sink;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod media;
pub mod meter;
pub mod orchestrator;
pub mod policy;
pub mod sdp;
pub mod signaling;
pub mod state;
pub mod task;
pub mod wire;

pub use config::CallConfig;
pub use error::CallError;
pub use orchestrator::{CallSessionOrchestrator, Platform, StartOutcome};
pub use state::{
    CallSnapshot, ConnectionState, EntitlementTier, SessionEvent, SessionSummary,
    TerminationReason,
};
