//! # Audio Codec
//!
//! Conversions between the sample representations used on each side of the
//! relay. Microphones produce floating point samples, the realtime API speaks
//! base64-encoded PCM16, and speakers want a playable container.
//!
//! ## Wire Format:
//! - **Sample Rate**: 24kHz (24,000 Hz)
//! - **Bit Depth**: 16-bit signed PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian, then standard base64 (with padding)

use crate::error::AudioError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const SAMPLE_RATE: u32 = 24_000;
pub const CHANNELS: u16 = 1;
pub const BITS_PER_SAMPLE: u16 = 16;

/// Convert one float sample to PCM16.
///
/// ## Scaling:
/// The input is clamped to [-1.0, 1.0] first. Negative values scale by
/// 0x8000 and positive values by 0x7FFF, so both ends of the range map
/// exactly onto `i16::MIN` and `i16::MAX`.
pub fn float_to_pcm16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Convert a PCM16 sample back to a float in [-1.0, 1.0).
pub fn pcm16_to_float(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Serialize samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Parse little-endian PCM16 bytes.
///
/// ## Errors:
/// An odd byte count cannot hold whole samples and is rejected.
pub fn bytes_to_pcm16(data: &[u8]) -> Result<Vec<i16>, AudioError> {
    if data.len() % 2 != 0 {
        return Err(AudioError::InvalidPcm(format!(
            "length must be even for 16-bit samples, got {} bytes",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode float samples as a base64 PCM16 frame, ready for `input_audio_buffer.append`.
pub fn encode_frame(samples: &[f32]) -> String {
    let pcm: Vec<i16> = samples.iter().map(|&s| float_to_pcm16(s)).collect();
    STANDARD.encode(pcm16_to_bytes(&pcm))
}

/// Decode a base64 PCM16 payload such as a `response.audio.delta`.
pub fn decode_frame(payload: &str) -> Result<Vec<i16>, AudioError> {
    let bytes = STANDARD.decode(payload.trim())?;
    bytes_to_pcm16(&bytes)
}

/// Wrap raw PCM16 samples in a WAV container for playback.
pub fn wrap_wav(samples: Vec<i16>) -> Result<Vec<u8>, AudioError> {
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, CHANNELS, SAMPLE_RATE, BITS_PER_SAMPLE);
    let mut out = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut out)?;
    Ok(out.into_inner())
}

/// Average interleaved channels down to mono.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let channels = channels as usize;
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_scaling_endpoints() {
        assert_eq!(float_to_pcm16(1.0), i16::MAX);
        assert_eq!(float_to_pcm16(-1.0), i16::MIN);
        assert_eq!(float_to_pcm16(0.0), 0);
        assert_eq!(float_to_pcm16(2.5), i16::MAX);
        assert_eq!(float_to_pcm16(-7.0), i16::MIN);
        assert_eq!(float_to_pcm16(f32::NAN), 0);
        assert_eq!(float_to_pcm16(0.5), 16383);
        assert_eq!(float_to_pcm16(-0.5), -16384);
    }

    #[test]
    fn test_byte_layout_is_little_endian() {
        assert_eq!(pcm16_to_bytes(&[1, -2]), vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(bytes_to_pcm16(&[0x01, 0x00, 0xFE, 0xFF]).unwrap(), vec![1, -2]);
    }

    #[test]
    fn test_odd_length_rejected() {
        assert!(matches!(bytes_to_pcm16(&[1, 2, 3]), Err(AudioError::InvalidPcm(_))));
    }

    #[test]
    fn test_encode_frame_and_decode() {
        let encoded = encode_frame(&[0.0, 1.0, -1.0]);
        assert_eq!(encoded, STANDARD.encode([0x00, 0x00, 0xFF, 0x7F, 0x00, 0x80]));
        assert_eq!(decode_frame(&encoded).unwrap(), vec![0, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_frame("!!not base64!!"), Err(AudioError::Base64(_))));
    }

    #[test]
    fn test_wav_header() {
        let wav = wrap_wav(vec![0; 240]).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 480);

        let mut cursor = Cursor::new(wav);
        let (header, data) = wav::read(&mut cursor).unwrap();
        assert_eq!(header.channel_count, 1);
        assert_eq!(header.sampling_rate, SAMPLE_RATE);
        assert_eq!(header.bits_per_sample, 16);
        assert_eq!(data.as_sixteen().map(|s| s.len()), Some(240));
    }

    #[test]
    fn test_downmix() {
        assert_eq!(downmix(&[1.0, 0.0, -1.0, -1.0], 2), vec![0.5, -1.0]);
        assert_eq!(downmix(&[0.25, 0.5], 1), vec![0.25, 0.5]);
    }
}
