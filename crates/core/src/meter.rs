//! Remote audio energy for the speaking-indicator visualisation.

use crate::{error::MeterError, media::RemoteStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// A frequency-domain analyser node attached to one remote stream.
pub trait AudioAnalyser: Send {
    /// Writes the current byte-scaled magnitude of each bin into `bins`.
    fn fill_frequency_data(&mut self, bins: &mut [u8]);
    /// Releases the analysis graph. Called exactly once per analyser.
    fn close(&mut self);
}

/// Builds analysers (the audio-context side of the platform).
pub trait AudioAnalysisContext: Send + Sync {
    fn create_analyser(
        &self,
        stream: &RemoteStream,
        fft_size: usize,
    ) -> Result<Box<dyn AudioAnalyser>, MeterError>;
}

/// Mean bin magnitude scaled to `[0, 1]`.
pub fn compute_level(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: u64 = bins.iter().map(|&b| u64::from(b)).sum();
    let mean = sum as f64 / bins.len() as f64;
    (mean / f64::from(u8::MAX)).clamp(0.0, 1.0) as f32
}

/// Shortest sampling period; a zero frame is raised to this.
pub const MIN_FRAME: Duration = Duration::from_millis(1);

pub struct AudioLevelMeter {
    context: Arc<dyn AudioAnalysisContext>,
    fft_size: usize,
    frame: Duration,
}

impl AudioLevelMeter {
    pub fn new(context: Arc<dyn AudioAnalysisContext>, fft_size: usize, frame: Duration) -> Self {
        Self {
            context,
            fft_size,
            frame: frame.max(MIN_FRAME),
        }
    }

    /// Samples `stream` once per frame, passing each level to `on_level`,
    /// until the returned handle is cancelled or dropped.
    pub fn start<F>(&self, stream: &RemoteStream, on_level: F) -> Result<MeterHandle, MeterError>
    where
        F: Fn(f32) + Send + 'static,
    {
        let analyser = self.context.create_analyser(stream, self.fft_size)?;
        let analyser = Arc::new(Mutex::new(Some(analyser)));
        let bin_count = self.fft_size / 2;
        let frame = self.frame;

        let sampling = analyser.clone();
        let task = tokio::spawn(async move {
            let mut bins = vec![0u8; bin_count];
            let mut ticker = tokio::time::interval(frame);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let level = {
                    let mut guard = sampling.lock().unwrap_or_else(PoisonError::into_inner);
                    let Some(analyser) = guard.as_mut() else {
                        break;
                    };
                    analyser.fill_frequency_data(&mut bins);
                    compute_level(&bins)
                };
                on_level(level);
            }
        });

        debug!(stream = %stream.id, bin_count, "Audio level meter started");
        Ok(MeterHandle { analyser, task })
    }
}

/// Cancels the sampling loop and closes the analyser.
pub struct MeterHandle {
    analyser: Arc<Mutex<Option<Box<dyn AudioAnalyser>>>>,
    task: JoinHandle<()>,
}

impl MeterHandle {
    /// Idempotent; the analyser is closed before this returns.
    pub fn cancel(&self) {
        self.task.abort();
        let taken = self
            .analyser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut analyser) = taken {
            analyser.close();
            debug!("Audio level meter stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.analyser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for MeterHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
