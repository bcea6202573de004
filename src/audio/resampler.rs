//! Streaming sample-rate conversion for captured audio.
//!
//! Device callbacks hand over blocks of arbitrary length, while the FFT
//! resampler consumes fixed-size chunks. Input is carried between calls so no
//! sample is lost at block boundaries and the filter state stays continuous.

use crate::error::AudioError;
use rubato::{FftFixedIn, Resampler};
use tracing::{debug, warn};

/// Input frames per FFT chunk.
const CHUNK_FRAMES: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Mono resampler that buffers input across device callbacks.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    input: Vec<Vec<f32>>,
    output: Vec<Vec<f32>>,
}

impl StreamResampler {
    /// Rates that already match make this a passthrough.
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, AudioError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(AudioError::Resample(format!("invalid rates {} -> {}", from_rate, to_rate)));
        }

        let inner = if from_rate == to_rate {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_FRAMES, SUB_CHUNKS, 1)
                .map_err(|e| AudioError::Resample(e.to_string()))?;
            debug!(from_rate, to_rate, "Created capture resampler");
            Some(resampler)
        };

        Ok(Self {
            inner,
            input: vec![Vec::new()],
            output: vec![Vec::new()],
        })
    }

    /// Feed one block and return whatever full chunks it completed.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return samples.to_vec();
        };

        self.input[0].extend_from_slice(samples);
        let mut resampled = Vec::new();

        loop {
            let needed = resampler.input_frames_next();
            if self.input[0].len() < needed {
                break;
            }
            let chunk = vec![self.input[0].drain(..needed).collect::<Vec<f32>>()];
            self.output[0].resize(resampler.output_frames_next(), 0.0);

            match resampler.process_into_buffer(&chunk, &mut self.output, None) {
                Ok((_, produced)) => resampled.extend_from_slice(&self.output[0][..produced]),
                Err(err) => warn!(error = %err, "Resampler rejected a chunk"),
            }
        }

        resampled
    }

    /// Input samples waiting for a full chunk.
    pub fn pending_input(&self) -> usize {
        self.input[0].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(rate: u32, seconds: f32) -> Vec<f32> {
        let total = (rate as f32 * seconds) as usize;
        (0..total)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_output_length_tracks_input_duration_across_blocks() {
        let input = tone(44_100, 10.0);
        let mut resampler = StreamResampler::new(44_100, 24_000).unwrap();

        let mut delivered = 0usize;
        let mut produced = 0usize;
        for block in input.chunks(512) {
            delivered += block.len();
            produced += resampler.process(block).len();
        }

        let consumed = delivered - resampler.pending_input();
        let expected = consumed as f64 * 24_000.0 / 44_100.0;
        assert!(
            (produced as f64 - expected).abs() < 1.0,
            "produced {} samples, expected {:.1}",
            produced,
            expected
        );
        // Whatever is still pending is less than one chunk
        let chunk = resampler.inner.as_ref().unwrap().input_frames_next();
        assert!(resampler.pending_input() < chunk);
    }

    #[test]
    fn test_block_size_does_not_change_output() {
        let input = tone(48_000, 2.0);

        let mut whole = StreamResampler::new(48_000, 24_000).unwrap();
        let at_once = whole.process(&input);

        let mut split = StreamResampler::new(48_000, 24_000).unwrap();
        let mut pieces = Vec::new();
        for block in input.chunks(333) {
            pieces.extend(split.process(block));
        }

        assert_eq!(at_once.len(), pieces.len());
        for (a, b) in at_once.iter().zip(&pieces) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_matching_rates_pass_through() {
        let mut resampler = StreamResampler::new(24_000, 24_000).unwrap();
        assert_eq!(resampler.process(&[0.1, -0.2, 0.3]), vec![0.1, -0.2, 0.3]);
        assert_eq!(resampler.pending_input(), 0);
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(matches!(StreamResampler::new(0, 24_000), Err(AudioError::Resample(_))));
    }
}
