//! cpal-backed capture strategies.
//!
//! - [`NativeInputStrategy`]: the device can deliver mono f32 at the target
//!   rate directly, so blocks go straight into the frame tap.
//! - [`ConvertingInputStrategy`]: the device's default configuration in any
//!   sample format, downmixed and resampled on the audio thread.
//!
//! cpal streams are not `Send`, so each one is built, played and dropped on a
//! dedicated thread. The returned [`CaptureStream`] only holds the stop
//! signal and the thread handle.

use crate::audio::capture::{CaptureConfig, CaptureStrategy, CaptureStream, FrameTap};
use crate::audio::codec;
use crate::audio::resampler::StreamResampler;
use crate::error::AudioError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleFormat, StreamConfig};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
pub struct NativeInputStrategy;

#[derive(Debug, Default)]
pub struct ConvertingInputStrategy;

fn default_input_device() -> Result<Device, AudioError> {
    cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no default input device".to_string()))
}

fn supports_native(device: &Device, config: &CaptureConfig) -> bool {
    match device.supported_input_configs() {
        Ok(mut ranges) => ranges.any(|range| {
            range.channels() == config.channels
                && range.sample_format() == SampleFormat::F32
                && range.min_sample_rate().0 <= config.sample_rate
                && range.max_sample_rate().0 >= config.sample_rate
        }),
        Err(err) => {
            debug!(error = %err, "Could not query input configurations");
            false
        }
    }
}

fn map_build_error(err: BuildStreamError) -> AudioError {
    match err {
        BuildStreamError::DeviceNotAvailable => AudioError::DeviceUnavailable("input device disappeared".to_string()),
        BuildStreamError::BackendSpecific { err } => {
            let description = err.description.to_lowercase();
            if description.contains("permission") || description.contains("denied") {
                AudioError::PermissionDenied
            } else {
                AudioError::InputStream(err.description)
            }
        }
        other => AudioError::InputStream(other.to_string()),
    }
}

fn log_stream_error(err: cpal::StreamError) {
    error!(error = %err, "Audio input stream error");
}

impl CaptureStrategy for NativeInputStrategy {
    fn name(&self) -> &'static str {
        "native"
    }

    fn is_supported(&self, config: &CaptureConfig) -> bool {
        default_input_device().map(|d| supports_native(&d, config)).unwrap_or(false)
    }

    fn open(&self, config: &CaptureConfig, mut tap: FrameTap) -> Result<Box<dyn CaptureStream>, AudioError> {
        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        if config.noise_suppression || config.echo_cancellation {
            debug!("Input processing hints are not exposed by cpal hosts, ignoring");
        }

        spawn_stream(self.name(), move || {
            let device = default_input_device()?;
            device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| tap.push_block(data),
                    log_stream_error,
                    None,
                )
                .map_err(map_build_error)
        })
    }
}

impl CaptureStrategy for ConvertingInputStrategy {
    fn name(&self) -> &'static str {
        "converting"
    }

    fn is_supported(&self, _config: &CaptureConfig) -> bool {
        default_input_device()
            .map(|d| d.default_input_config().is_ok())
            .unwrap_or(false)
    }

    fn open(&self, config: &CaptureConfig, tap: FrameTap) -> Result<Box<dyn CaptureStream>, AudioError> {
        let target_rate = config.sample_rate;

        spawn_stream(self.name(), move || {
            let device = default_input_device()?;
            let supported = device
                .default_input_config()
                .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
            let format = supported.sample_format();
            let stream_config: StreamConfig = supported.into();
            let channels = stream_config.channels;
            let source_rate = stream_config.sample_rate.0;
            debug!(channels, source_rate, ?format, "Converting input to mono PCM");

            let mut convert = Converter {
                tap,
                channels,
                resampler: StreamResampler::new(source_rate, target_rate)?,
            };

            let stream = match format {
                SampleFormat::F32 => device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| convert.push(data),
                    log_stream_error,
                    None,
                ),
                SampleFormat::I16 => device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let floats: Vec<f32> = data.iter().map(|&s| codec::pcm16_to_float(s)).collect();
                        convert.push(&floats)
                    },
                    log_stream_error,
                    None,
                ),
                SampleFormat::U16 => device.build_input_stream(
                    &stream_config,
                    move |data: &[u16], _: &cpal::InputCallbackInfo| {
                        let floats: Vec<f32> = data.iter().map(|&s| (s as f32 - 32768.0) / 32768.0).collect();
                        convert.push(&floats)
                    },
                    log_stream_error,
                    None,
                ),
                other => {
                    return Err(AudioError::InputStream(format!("unsupported sample format {:?}", other)));
                }
            };
            stream.map_err(map_build_error)
        })
    }
}

struct Converter {
    tap: FrameTap,
    channels: u16,
    resampler: StreamResampler,
}

impl Converter {
    fn push(&mut self, interleaved: &[f32]) {
        let mono = codec::downmix(interleaved, self.channels);
        let resampled = self.resampler.process(&mono);
        if !resampled.is_empty() {
            self.tap.push_block(&resampled);
        }
    }
}

/// Handle to a stream living on its own thread.
struct DeviceStream {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureStream for DeviceStream {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_stream<F>(name: &'static str, build: F) -> Result<Box<dyn CaptureStream>, AudioError>
where
    F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let thread = std::thread::Builder::new()
        .name(format!("capture-{}", name))
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            if let Err(err) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::InputStream(err.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Sender dropped or stop sent: either way, release the device
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| AudioError::InputStream(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(Box::new(DeviceStream {
            stop: Some(stop_tx),
            thread: Some(thread),
        })),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => {
            let _ = thread.join();
            Err(AudioError::InputStream("capture thread exited before starting".to_string()))
        }
    }
}
