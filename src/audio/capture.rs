//! # Audio Capture
//!
//! Acquires a microphone stream and turns it into a steady sequence of
//! base64 PCM16 frames delivered over a bounded channel.
//!
//! ## Strategy selection:
//! Several [`CaptureStrategy`] implementations can back a capture. On
//! `start()` each is probed in priority order and the first one that reports
//! support (and opens cleanly) is used. Callers only ever see
//! [`AudioCapture`] and the frame receiver, whichever strategy is active.
//!
//! ## Threading:
//! Strategies run their device callback on their own audio thread. That
//! thread owns a [`FrameTap`] and is the only producer on the channel; it
//! never blocks. When the consumer falls behind, whole frames are dropped
//! with a warning instead of stalling the device.

use crate::audio::buffer::FrameAssembler;
use crate::audio::codec;
use crate::config::AudioConfig;
use crate::error::AudioError;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// What the capture asks of the device.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per emitted frame
    pub frame_samples: usize,
    /// Frames buffered between the audio thread and the consumer
    pub channel_capacity: usize,
    /// Processing hints; honored only where the host exposes them
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: codec::SAMPLE_RATE,
            channels: codec::CHANNELS,
            frame_samples: 4096,
            channel_capacity: 32,
            noise_suppression: true,
            echo_cancellation: true,
        }
    }
}

impl From<&AudioConfig> for CaptureConfig {
    fn from(audio: &AudioConfig) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            frame_samples: audio.frame_samples,
            ..Self::default()
        }
    }
}

/// One encoded frame, ready to be wrapped in an append event.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// Base64 of little-endian PCM16 samples
    pub payload: String,
    pub samples: usize,
    /// Position in this capture, starting at 0
    pub sequence: u64,
}

/// Producer half handed to a strategy: assembles, encodes and sends frames.
pub struct FrameTap {
    assembler: FrameAssembler,
    sender: mpsc::Sender<CapturedFrame>,
    next_sequence: u64,
    dropped: u64,
}

impl FrameTap {
    pub fn new(frame_samples: usize, sender: mpsc::Sender<CapturedFrame>) -> Self {
        Self {
            assembler: FrameAssembler::new(frame_samples),
            sender,
            next_sequence: 0,
            dropped: 0,
        }
    }

    /// Feed one processing block of mono samples at the target rate.
    pub fn push_block(&mut self, block: &[f32]) {
        for frame in self.assembler.push(block) {
            let captured = CapturedFrame {
                payload: codec::encode_frame(&frame),
                samples: frame.len(),
                sequence: self.next_sequence,
            };
            self.next_sequence += 1;

            match self.sender.try_send(captured) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    self.dropped += 1;
                    warn!(sequence = frame.sequence, dropped = self.dropped, "Capture consumer is behind, dropping frame");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Capture receiver dropped, discarding frame");
                }
            }
        }
    }

    /// Frames lost because the channel was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }
}

/// A running device stream. Stopping releases the device.
pub trait CaptureStream: Send {
    /// Must tolerate being called more than once.
    fn stop(&mut self);
}

/// One way of tapping the microphone.
pub trait CaptureStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap capability probe; must not open the device.
    fn is_supported(&self, config: &CaptureConfig) -> bool;

    fn open(&self, config: &CaptureConfig, tap: FrameTap) -> Result<Box<dyn CaptureStream>, AudioError>;
}

struct ActiveCapture {
    strategy: &'static str,
    stream: Box<dyn CaptureStream>,
}

/// Microphone capture behind a single start/stop interface.
pub struct AudioCapture {
    config: CaptureConfig,
    strategies: Vec<Box<dyn CaptureStrategy>>,
    active: Option<ActiveCapture>,
}

impl AudioCapture {
    /// Capture over an explicit strategy list, highest priority first.
    pub fn new(config: CaptureConfig, strategies: Vec<Box<dyn CaptureStrategy>>) -> Self {
        Self {
            config,
            strategies,
            active: None,
        }
    }

    /// Capture over the device strategies compiled into this build.
    ///
    /// Without the `microphone` feature the list is empty and `start()`
    /// reports the device as unavailable.
    pub fn with_default_strategies(config: CaptureConfig) -> Self {
        #[allow(unused_mut)]
        let mut strategies: Vec<Box<dyn CaptureStrategy>> = Vec::new();
        #[cfg(feature = "microphone")]
        {
            strategies.push(Box::new(crate::audio::microphone::NativeInputStrategy::default()));
            strategies.push(Box::new(crate::audio::microphone::ConvertingInputStrategy::default()));
        }
        Self::new(config, strategies)
    }

    /// Open the microphone and return the frame receiver.
    ///
    /// ## Errors:
    /// - **AlreadyActive**: a capture is running; stop it first
    /// - **PermissionDenied**: returned as soon as any strategy reports it
    /// - **DeviceUnavailable**: no strategy is supported on this host
    /// - otherwise the last strategy's open error
    pub fn start(&mut self) -> Result<mpsc::Receiver<CapturedFrame>, AudioError> {
        if self.active.is_some() {
            return Err(AudioError::AlreadyActive);
        }

        let mut last_error = None;
        for strategy in self.strategies.iter().filter(|s| s.is_supported(&self.config)) {
            let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
            let tap = FrameTap::new(self.config.frame_samples, tx);

            match strategy.open(&self.config, tap) {
                Ok(stream) => {
                    info!(
                        strategy = strategy.name(),
                        sample_rate = self.config.sample_rate,
                        frame_samples = self.config.frame_samples,
                        "Audio capture started"
                    );
                    self.active = Some(ActiveCapture {
                        strategy: strategy.name(),
                        stream,
                    });
                    return Ok(rx);
                }
                Err(AudioError::PermissionDenied) => return Err(AudioError::PermissionDenied),
                Err(err) => {
                    warn!(strategy = strategy.name(), error = %err, "Capture strategy failed to open, trying next");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AudioError::DeviceUnavailable("no supported capture strategy".to_string())))
    }

    /// Release the device. Safe to call repeatedly or before `start()`.
    pub fn stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.stream.stop();
            info!(strategy = active.strategy, "Audio capture stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Name of the strategy backing the running capture.
    pub fn active_strategy(&self) -> Option<&'static str> {
        self.active.as_ref().map(|a| a.strategy)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
