//! Local camera and microphone acquisition.
//!
//! The platform capture API is reached through [`MediaDevices`]; this module
//! decides what to ask for, how tolerant to be of partial results, and
//! guarantees that every acquired track is stopped on release.

use crate::error::MediaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub facing_mode: FacingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// What to request from the capture devices. `None` means "do not request".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Front camera at 720p (up to 1080p) plus a processed microphone.
    pub fn interview() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints {
                ideal_width: 1280,
                ideal_height: 720,
                max_width: 1920,
                max_height: 1080,
                facing_mode: FacingMode::User,
            }),
        }
    }

    pub fn audio_only(&self) -> Self {
        Self {
            audio: Some(self.audio.clone().unwrap_or_default()),
            video: None,
        }
    }
}

/// A single live capture track owned by the platform.
///
/// `stop` must be safe to call more than once.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// The platform capture API (a `getUserMedia` equivalent).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError>;
}

/// Receives the raw local stream for on-screen preview.
pub trait PreviewSink: Send + Sync {
    fn attach(&self, stream: &LocalStream);
    fn detach(&self);
}

/// The set of local tracks for one call attempt.
#[derive(Debug)]
pub struct LocalStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
    released: AtomicBool,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            tracks,
            released: AtomicBool::new(false),
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn has_audio(&self) -> bool {
        self.audio_tracks().next().is_some()
    }

    /// Mirrors the mute flag into every local audio track.
    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.audio_tracks() {
            track.set_enabled(enabled);
        }
    }

    /// Stops every track. Subsequent calls do nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for track in &self.tracks {
            track.stop();
        }
        info!(tracks = self.tracks.len(), "Local media released");
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// How strictly a partial track set is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// One combined request; a microphone track is mandatory.
    Strict,
    /// Accepts whatever subset arrives and falls back to audio-only once
    /// when the combined request finds no device.
    Tolerant,
}

/// Opens and releases the local camera and microphone.
pub struct MediaAcquisition {
    devices: Arc<dyn MediaDevices>,
    preview: Option<Arc<dyn PreviewSink>>,
    mode: AcquisitionMode,
}

impl MediaAcquisition {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        preview: Option<Arc<dyn PreviewSink>>,
        mode: AcquisitionMode,
    ) -> Self {
        Self {
            devices,
            preview,
            mode,
        }
    }

    pub async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        let tracks = match self.devices.get_user_media(constraints).await {
            Ok(tracks) => tracks,
            Err(MediaError::DeviceNotFound)
                if self.mode == AcquisitionMode::Tolerant && constraints.video.is_some() =>
            {
                warn!("Combined capture request found no device, retrying audio-only");
                self.devices
                    .get_user_media(&constraints.audio_only())
                    .await?
            }
            Err(e) => return Err(e),
        };

        let stream = LocalStream::new(tracks);
        match self.mode {
            AcquisitionMode::Strict if !stream.has_audio() => {
                stream.release();
                return Err(MediaError::DeviceNotFound);
            }
            AcquisitionMode::Tolerant if stream.tracks().is_empty() => {
                return Err(MediaError::DeviceNotFound);
            }
            _ => {}
        }

        info!(
            audio = stream.audio_tracks().count(),
            video = stream.video_tracks().count(),
            "Local media acquired"
        );
        if let Some(preview) = &self.preview {
            preview.attach(&stream);
        }
        Ok(stream)
    }

    pub fn release(&self, stream: &LocalStream) {
        if let Some(preview) = &self.preview {
            preview.detach();
        }
        stream.release();
    }
}

/// The remote party's media as delivered by the transport.
///
/// A new value is built for every incoming audio track; holders of an older
/// `Arc<RemoteStream>` keep a consistent, if stale, view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub id: String,
    pub audio_track_ids: Vec<String>,
}
