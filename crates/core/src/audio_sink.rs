//! Connects the remote stream to an audible output.
//!
//! Platforms commonly refuse playback until the user has interacted with the
//! page, and may deliver the remote track before that. Installation is
//! therefore retried on a fixed schedule and again on the next user gesture.
//! A blocked sink never fails the call.

use crate::{error::SinkError, media::RemoteStream, task::TaskSlot};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// The platform's audible output element.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play(&self, stream: &RemoteStream) -> Result<(), SinkError>;
    fn detach(&self);
}

#[derive(Default)]
struct SinkState {
    stream: Option<Arc<RemoteStream>>,
    playing: bool,
    /// Bumped on every install/detach so stale attempts can be discarded.
    generation: u64,
    retries: TaskSlot,
}

struct Shared {
    output: Arc<dyn AudioOutput>,
    state: Mutex<SinkState>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One playback attempt for `generation`. Returns whether audio is playing.
    async fn attempt(&self, generation: u64) -> bool {
        let stream = {
            let state = self.lock();
            if state.generation != generation {
                return false;
            }
            if state.playing {
                return true;
            }
            match &state.stream {
                Some(stream) => stream.clone(),
                None => return false,
            }
        };

        match self.output.play(&stream).await {
            Ok(()) => {
                let mut state = self.lock();
                if state.generation != generation {
                    return false;
                }
                state.playing = true;
                info!(stream = %stream.id, "Remote audio playing");
                true
            }
            Err(SinkError::AutoplayBlocked) => {
                debug!(stream = %stream.id, "Remote audio blocked by autoplay policy");
                false
            }
            Err(e) => {
                warn!(stream = %stream.id, error = %e, "Remote audio sink failed");
                false
            }
        }
    }
}

pub struct AudioSinkManager {
    shared: Arc<Shared>,
    schedule: Vec<Duration>,
}

impl AudioSinkManager {
    /// `schedule` holds attempt offsets measured from installation.
    pub fn new(output: Arc<dyn AudioOutput>, schedule: Vec<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                output,
                state: Mutex::new(SinkState::default()),
            }),
            schedule,
        }
    }

    /// Routes `stream` to the output. Re-installing the stream that is
    /// already installed is a no-op.
    pub fn install(&self, stream: Arc<RemoteStream>) {
        let mut state = self.shared.lock();
        if state
            .stream
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &stream))
        {
            return;
        }

        state.generation += 1;
        state.stream = Some(stream);
        state.playing = false;
        let generation = state.generation;

        let shared = self.shared.clone();
        let schedule = self.schedule.clone();
        state.retries.replace(tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            for (attempt, offset) in schedule.into_iter().enumerate() {
                tokio::time::sleep_until(started + offset).await;
                if shared.attempt(generation).await {
                    return;
                }
                debug!(attempt, "Audio sink attempt did not start playback");
            }
            warn!("Audio sink retries exhausted; waiting for a user interaction");
        }));
    }

    /// Re-attempts playback after a pointer/touch gesture unlocked audio.
    pub async fn on_user_interaction(&self) -> bool {
        let generation = {
            let state = self.shared.lock();
            if state.stream.is_none() {
                return false;
            }
            state.generation
        };
        self.shared.attempt(generation).await
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().playing
    }

    /// Cancels pending retries and detaches the output. Idempotent.
    pub fn detach(&self) {
        let mut state = self.shared.lock();
        state.retries.cancel();
        state.generation += 1;
        state.playing = false;
        if state.stream.take().is_some() {
            self.shared.output.detach();
        }
    }
}

impl Drop for AudioSinkManager {
    fn drop(&mut self) {
        self.detach();
    }
}
