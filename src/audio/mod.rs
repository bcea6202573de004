//! # Client-side Audio
//!
//! Everything a native voice client needs to talk to the relay: microphone
//! capture, the wire codec, and ordered speaker playback.
//!
//! ## Key Components:
//! - **codec**: f32 ⇄ PCM16, base64 framing, WAV wrapping, downmix
//! - **resampler**: streaming rate conversion that carries input across blocks
//! - **buffer**: fixed-size frame assembly from arbitrary device blocks
//! - **capture**: strategy-probing microphone capture over a bounded channel
//! - **playback**: strict FIFO clip playback with abrupt `clear()`
//!
//! Device backends are optional features: `microphone` (cpal) and `speaker`
//! (rodio). Without them the capture and playback types are still usable with
//! any [`capture::CaptureStrategy`] / [`playback::ClipPlayer`].
//!
//! ## Audio Format:
//! - **Sample Rate**: 24kHz
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: Mono

pub mod buffer;
pub mod capture;
pub mod codec;
#[cfg(feature = "microphone")]
pub mod microphone;
pub mod playback;
pub mod resampler;
#[cfg(feature = "speaker")]
pub mod speaker;

pub use capture::{AudioCapture, CaptureConfig, CapturedFrame};
pub use playback::{ClipPlayer, PlaybackQueue};
